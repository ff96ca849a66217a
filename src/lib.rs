// ecoflash: ALDL flash, datalog and live-tune engine for Delco HC11
// ECUs (Holden VX/VY V6, OS $060A family).
//
// The stack, bottom-up: transport (serial cable or in-process simulator)
// → ALDL frame codec → session engine → flash orchestrator, datalogger
// and live tuner. GUI, CLI parsing and logger setup belong to callers.

pub mod aldl;
pub mod config;
pub mod datalog;
pub mod error;
pub mod flash;
pub mod image;
pub mod kernel;
pub mod params;
pub mod session;
pub mod sim;
pub mod tables;
pub mod transport;
pub mod tuner;

pub use config::CommConfig;
pub use error::FlashError;
pub use flash::{FlashOp, WriteMode};
pub use image::BinImage;
pub use session::{EcuSession, SessionState};
pub use transport::Transport;
