// Mode 1 Message 0 data-stream decoding. The parameter set is fixed per
// ECU family: these are the confirmed RAM addresses from the VS_Mode1
// definition table at $50FE (VS/VX/VY V6 Delco).

use std::collections::HashMap;

/// One parameter in the Mode 1 data stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamParam {
    pub name: &'static str,
    /// ECU RAM address the value is sampled from (informational).
    pub ram_addr: u16,
    /// Byte offset within the Mode 1 Msg 0 response data.
    pub pkt_offset: usize,
    /// 1 or 2 bytes; 16-bit values are big-endian.
    pub size: u8,
    pub signed: bool,
    pub units: &'static str,
    /// value = raw * scale + offset
    pub scale: f64,
    pub offset: f64,
}

const fn p(
    name: &'static str,
    ram_addr: u16,
    pkt_offset: usize,
    size: u8,
    units: &'static str,
    scale: f64,
    offset: f64,
) -> StreamParam {
    StreamParam { name, ram_addr, pkt_offset, size, signed: false, units, scale, offset }
}

/// Mode 1 Message 0, 60 data bytes.
pub const MODE1_MSG0_PARAMS: &[StreamParam] = &[
    p("RPM", 0x0089, 0, 2, "RPM", 25.0, 0.0),
    p("Desired Idle", 0x1835, 2, 2, "RPM", 25.0, 0.0),
    p("ECT Voltage", 0x1908, 4, 1, "V", 5.0 / 255.0, 0.0),
    p("ECT Temp", 0x190A, 5, 1, "°C", 0.75, -40.0),
    p("IAT Voltage", 0x1901, 6, 1, "V", 5.0 / 255.0, 0.0),
    p("IAT Temp", 0x1904, 7, 1, "°C", 0.75, -40.0),
    p("MAF Freq", 0x014F, 8, 2, "Hz", 1.0, 0.0),
    p("MAF", 0x011C, 10, 2, "g/s", 1.0, 0.0),
    p("TPS Voltage", 0x017A, 12, 1, "V", 5.0 / 255.0, 0.0),
    p("TPS %", 0x1B77, 13, 1, "%", 1.0 / 2.55, 0.0),
    p("LH O2", 0x0061, 14, 1, "mV", 4.44, 0.0),
    p("LH O2 Xcount", 0x1827, 15, 1, "", 1.0, 0.0),
    p("RH O2", 0x0060, 16, 1, "mV", 4.44, 0.0),
    p("RH O2 Xcount", 0x1826, 17, 1, "", 1.0, 0.0),
    p("Inj PW", 0x0153, 18, 2, "ms", 0.01526, 0.0),
    p("Inj Voltage", 0x1843, 20, 1, "V", 0.1, 0.0),
    p("LH STFT", 0x0124, 21, 1, "%", 1.0 / 1.28, -100.0),
    p("RH STFT", 0x0123, 22, 1, "%", 1.0 / 1.28, -100.0),
    p("LH LTFT", 0x0077, 23, 1, "%", 1.0 / 1.28, -100.0),
    p("RH LTFT", 0x0072, 24, 1, "%", 1.0 / 1.28, -100.0),
    p("BLM Cell", 0x006F, 25, 1, "", 1.0, 0.0),
    p("STFT Change", 0x0302, 26, 1, "", 1.0, 0.0),
    p("LTFT Var", 0x0303, 27, 1, "", 1.0, 0.0),
    p("AFR", 0x182A, 28, 1, ":1", 0.1, 0.0),
    p("Battery V", 0x006A, 29, 1, "V", 0.1, 0.0),
    p("Ref Voltage", 0x1841, 30, 1, "V", 0.02, 0.0),
    p("Status 32", 0x0030, 31, 1, "", 1.0, 0.0),
    p("Status 33", 0x0031, 32, 1, "", 1.0, 0.0),
    p("Status 34", 0x0032, 33, 1, "", 1.0, 0.0),
    p("Status 35", 0x0033, 34, 1, "", 1.0, 0.0),
    p("Knock Retard", 0x0188, 35, 1, "°", 0.351, 0.0),
    p("EPROM ID Hi", 0x2000, 36, 1, "", 1.0, 0.0),
    p("EPROM ID Lo", 0x2001, 37, 1, "", 1.0, 0.0),
    p("mg/s/cyl", 0x0067, 38, 1, "mg/s", 1.0, 0.0),
    p("Wheel Speed", 0x0208, 39, 1, "km/h", 1.0, 0.0),
    p("Idle Var", 0x1A3D, 40, 2, "RPM", 1.0, 0.0),
    p("IAC Steps", 0x001D, 42, 1, "steps", 1.0, 0.0),
    p("Spark Advance", 0x01A7, 43, 2, "°", 90.0 / 256.0, -35.0),
    p("Eng Perf 100", 0x0352, 45, 1, "%", 1.0 / 2.55, 0.0),
    p("Eng Perf 50", 0x0354, 46, 1, "%", 1.0 / 2.55, 0.0),
    p("EGR Pintle", 0x18F8, 47, 1, "V", 5.0 / 255.0, 0.0),
    p("EGR Feedback", 0x18F2, 48, 1, "V", 5.0 / 255.0, 0.0),
    p("EGR Desired", 0x18F1, 49, 1, "V", 5.0 / 255.0, 0.0),
    p("Canister Purge", 0x189B, 50, 1, "%", 1.0 / 2.55, 0.0),
    p("Fuel Consump", 0x0175, 51, 2, "L/100k", 1.0, 0.0),
    p("Run Time", 0x001E, 53, 2, "sec", 1.0, 0.0),
];

/// Look up a parameter descriptor by name.
pub fn param_by_name(name: &str) -> Option<&'static StreamParam> {
    MODE1_MSG0_PARAMS.iter().find(|p| p.name == name)
}

/// Decode a Mode 1 Msg 0 data payload into named values, quantised to
/// three decimal places. Parameters past the end of a short payload are
/// skipped rather than failing the whole sample.
pub fn decode_mode1(data: &[u8]) -> HashMap<&'static str, f64> {
    let mut out = HashMap::with_capacity(MODE1_MSG0_PARAMS.len());
    for p in MODE1_MSG0_PARAMS {
        if p.pkt_offset + p.size as usize > data.len() {
            continue;
        }
        let raw: i32 = match p.size {
            1 => {
                let b = data[p.pkt_offset];
                if p.signed { b as i8 as i32 } else { b as i32 }
            }
            2 => {
                let w = ((data[p.pkt_offset] as u16) << 8) | data[p.pkt_offset + 1] as u16;
                if p.signed { w as i16 as i32 } else { w as i32 }
            }
            _ => continue,
        };
        let value = raw as f64 * p.scale + p.offset;
        out.insert(p.name, (value * 1000.0).round() / 1000.0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names() {
        for (i, a) in MODE1_MSG0_PARAMS.iter().enumerate() {
            for b in &MODE1_MSG0_PARAMS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_params_fit_in_60_bytes() {
        for p in MODE1_MSG0_PARAMS {
            assert!(p.pkt_offset + p.size as usize <= 60, "{} overruns packet", p.name);
        }
    }

    #[test]
    fn test_decode_rpm() {
        let mut data = [0u8; 60];
        data[0] = 0x00;
        data[1] = 0x20; // 32 · 25 = 800 RPM
        let out = decode_mode1(&data);
        assert_eq!(out["RPM"], 800.0);
    }

    #[test]
    fn test_decode_ect() {
        let mut data = [0u8; 60];
        data[5] = 120; // 120 · 0.75 − 40 = 50 °C
        let out = decode_mode1(&data);
        assert_eq!(out["ECT Temp"], 50.0);
    }

    #[test]
    fn test_decode_battery() {
        let mut data = [0u8; 60];
        data[29] = 140; // 14.0 V
        let out = decode_mode1(&data);
        assert_eq!(out["Battery V"], 14.0);
    }

    #[test]
    fn test_decode_quantised() {
        let mut data = [0u8; 60];
        data[35] = 7; // knock retard 7 · 0.351 = 2.457
        let out = decode_mode1(&data);
        assert_eq!(out["Knock Retard"], 2.457);
    }

    #[test]
    fn test_short_payload_skips_tail() {
        let data = [0u8; 10];
        let out = decode_mode1(&data);
        assert!(out.contains_key("RPM"));
        assert!(!out.contains_key("Run Time"));
    }
}
