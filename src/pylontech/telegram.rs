//! Frame codec for the Pylontech LV telegram family.
//!
//! Pure conversion between raw CAN payloads and typed telegram records, in
//! both directions. No sockets and no clocks in here, so every mapping can
//! be pinned down with wire vectors.
//!
//! All multi-byte fields are little-endian. Encoders clamp to the
//! representable range, round to the wire scale and pad the frame to eight
//! bytes with zeros. Decoders return [`FrameKind::Ignored`] for identifiers
//! outside the family and [`CodecError::Truncated`] for known identifiers
//! with short payloads.

use std::fmt;

use enum_dispatch::enum_dispatch;

use crate::pylontech::flags::{ErrorFlags, StatusFlags, WarningFlags};

pub const ID_CHARGE_PARAMS: u16 = 0x351;
pub const ID_SOC_SOH: u16 = 0x355;
pub const ID_MEASUREMENTS: u16 = 0x356;
pub const ID_ALARMS: u16 = 0x359;
pub const ID_STATUS: u16 = 0x35C;
pub const ID_MANUFACTURER: u16 = 0x35E;
pub const ID_SYNC: u16 = 0x305;

pub const FRAME_DLC: usize = 8;

// 0x359 bytes 5-6, fixed vendor tag on the wire
const VENDOR_TAG: [u8; 2] = *b"PN";

// CodecError {{{
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    Truncated { id: u16, len: usize, need: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated { id, len, need } => {
                write!(f, "telegram {id:#05x} truncated: {len} bytes, need {need}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

fn need(id: u16, data: &[u8], need: usize) -> Result<(), CodecError> {
    if data.len() < need {
        return Err(CodecError::Truncated {
            id,
            len: data.len(),
            need,
        });
    }
    Ok(())
}
// }}}

// field helpers {{{
fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le_i16(data: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([data[at], data[at + 1]])
}

fn scaled_u16(value: f64, scale: f64) -> [u8; 2] {
    let raw = (value * scale).round().clamp(0.0, f64::from(u16::MAX));
    (raw as u16).to_le_bytes()
}

fn scaled_i16(value: f64, scale: f64) -> [u8; 2] {
    let raw = (value * scale)
        .round()
        .clamp(f64::from(i16::MIN), f64::from(i16::MAX));
    (raw as i16).to_le_bytes()
}
// }}}

#[enum_dispatch]
pub trait TelegramCommon {
    fn id(&self) -> u16;
    fn bytes(&self) -> [u8; FRAME_DLC];
}

#[enum_dispatch(TelegramCommon)]
#[derive(Debug, Clone, PartialEq)]
pub enum Telegram {
    ChargeParams,
    SocSoh,
    Measurements,
    Alarms,
    Status,
    Manufacturer,
    InverterSync,
}

/// Decode result: a telegram of the family, or a frame to pass over.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    Telegram(Telegram),
    Ignored,
}

pub fn decode(id: u16, data: &[u8]) -> Result<FrameKind, CodecError> {
    let telegram = match id {
        ID_CHARGE_PARAMS => ChargeParams::decode(data)?.into(),
        ID_SOC_SOH => SocSoh::decode(data)?.into(),
        ID_MEASUREMENTS => Measurements::decode(data)?.into(),
        ID_ALARMS => Alarms::decode(data)?.into(),
        ID_STATUS => Status::decode(data)?.into(),
        ID_MANUFACTURER => Manufacturer::decode(data).into(),
        // A sync carries exactly eight zero bytes; anything else on this
        // identifier is not addressed to us.
        ID_SYNC => {
            if data.len() == FRAME_DLC && data.iter().all(|b| *b == 0) {
                InverterSync.into()
            } else {
                return Ok(FrameKind::Ignored);
            }
        }
        _ => return Ok(FrameKind::Ignored),
    };
    Ok(FrameKind::Telegram(telegram))
}

// ChargeParams 0x351 {{{
/// Charge voltage setpoint, current limits and discharge cutoff voltage.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeParams {
    /// End-of-charge voltage request in V
    pub u_charge: f64,
    /// Charging current limit in A
    pub i_lim_charge: f64,
    /// Discharging current limit in A
    pub i_lim_discharge: f64,
    /// Low-cutoff voltage request in V
    pub u_discharge: f64,
}

impl ChargeParams {
    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        need(ID_CHARGE_PARAMS, data, 8)?;
        Ok(Self {
            u_charge: f64::from(le_u16(data, 0)) * 0.1,
            i_lim_charge: f64::from(le_u16(data, 2)) * 0.1,
            i_lim_discharge: f64::from(le_u16(data, 4)) * 0.1,
            u_discharge: f64::from(le_u16(data, 6)) * 0.1,
        })
    }
}

impl TelegramCommon for ChargeParams {
    fn id(&self) -> u16 {
        ID_CHARGE_PARAMS
    }

    fn bytes(&self) -> [u8; FRAME_DLC] {
        let mut r = [0u8; FRAME_DLC];
        r[0..2].copy_from_slice(&scaled_u16(self.u_charge, 10.0));
        r[2..4].copy_from_slice(&scaled_u16(self.i_lim_charge, 10.0));
        r[4..6].copy_from_slice(&scaled_u16(self.i_lim_discharge, 10.0));
        r[6..8].copy_from_slice(&scaled_u16(self.u_discharge, 10.0));
        r
    }
}
// }}}

// SocSoh 0x355 {{{
/// State of charge and state of health, both in percent.
#[derive(Debug, Clone, PartialEq)]
pub struct SocSoh {
    pub soc: u16,
    pub soh: u16,
}

impl SocSoh {
    pub fn new(soc: f64, soh: f64) -> Self {
        Self {
            soc: soc.round().clamp(0.0, f64::from(u16::MAX)) as u16,
            soh: soh.round().clamp(0.0, f64::from(u16::MAX)) as u16,
        }
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        need(ID_SOC_SOH, data, 4)?;
        Ok(Self {
            soc: le_u16(data, 0),
            soh: le_u16(data, 2),
        })
    }
}

impl TelegramCommon for SocSoh {
    fn id(&self) -> u16 {
        ID_SOC_SOH
    }

    fn bytes(&self) -> [u8; FRAME_DLC] {
        let mut r = [0u8; FRAME_DLC];
        r[0..2].copy_from_slice(&self.soc.to_le_bytes());
        r[2..4].copy_from_slice(&self.soh.to_le_bytes());
        r
    }
}
// }}}

// Measurements 0x356 {{{
/// Measured pack voltage, current and temperature. Current is signed,
/// positive while charging.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurements {
    /// V
    pub u: f64,
    /// A
    pub i: f64,
    /// °C
    pub t: f64,
}

impl Measurements {
    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        need(ID_MEASUREMENTS, data, 6)?;
        Ok(Self {
            u: f64::from(le_i16(data, 0)) * 0.01,
            i: f64::from(le_i16(data, 2)) * 0.1,
            t: f64::from(le_i16(data, 4)) * 0.1,
        })
    }
}

impl TelegramCommon for Measurements {
    fn id(&self) -> u16 {
        ID_MEASUREMENTS
    }

    fn bytes(&self) -> [u8; FRAME_DLC] {
        let mut r = [0u8; FRAME_DLC];
        r[0..2].copy_from_slice(&scaled_i16(self.u, 100.0));
        r[2..4].copy_from_slice(&scaled_i16(self.i, 10.0));
        r[4..6].copy_from_slice(&scaled_i16(self.t, 10.0));
        r
    }
}
// }}}

// Alarms 0x359 {{{
/// Protection and alarm bitsets plus the module count.
#[derive(Debug, Clone, PartialEq)]
pub struct Alarms {
    pub errors: ErrorFlags,
    pub warnings: WarningFlags,
    pub n_modules: u8,
}

impl Alarms {
    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        need(ID_ALARMS, data, 5)?;
        Ok(Self {
            errors: ErrorFlags::from_bytes(data[0], data[1]),
            warnings: WarningFlags::from_bytes(data[2], data[3]),
            n_modules: data[4],
        })
    }
}

impl TelegramCommon for Alarms {
    fn id(&self) -> u16 {
        ID_ALARMS
    }

    fn bytes(&self) -> [u8; FRAME_DLC] {
        let mut r = [0u8; FRAME_DLC];
        r[0..2].copy_from_slice(&self.errors.to_bytes());
        r[2..4].copy_from_slice(&self.warnings.to_bytes());
        r[4] = self.n_modules;
        r[5..7].copy_from_slice(&VENDOR_TAG);
        r
    }
}
// }}}

// Status 0x35C {{{
/// Charge/discharge enable and charge request bits.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub flags: StatusFlags,
}

impl Status {
    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        need(ID_STATUS, data, 1)?;
        Ok(Self {
            flags: StatusFlags::from_bits(data[0]),
        })
    }
}

impl TelegramCommon for Status {
    fn id(&self) -> u16 {
        ID_STATUS
    }

    fn bytes(&self) -> [u8; FRAME_DLC] {
        let mut r = [0u8; FRAME_DLC];
        r[0] = self.flags.bits();
        r
    }
}
// }}}

// Manufacturer 0x35E {{{
/// Manufacturer name, up to eight ASCII bytes, NUL padded.
#[derive(Debug, Clone, PartialEq)]
pub struct Manufacturer {
    pub name: [u8; FRAME_DLC],
}

impl Manufacturer {
    pub fn new(name: &str) -> Self {
        let mut r = [0u8; FRAME_DLC];
        let bytes = name.as_bytes();
        let n = bytes.len().min(FRAME_DLC);
        r[..n].copy_from_slice(&bytes[..n]);
        Self { name: r }
    }

    // Short payloads are zero padded rather than rejected, the field is
    // informational only.
    fn decode(data: &[u8]) -> Self {
        let mut r = [0u8; FRAME_DLC];
        let n = data.len().min(FRAME_DLC);
        r[..n].copy_from_slice(&data[..n]);
        Self { name: r }
    }

    pub fn as_str(&self) -> &str {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(FRAME_DLC);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

impl TelegramCommon for Manufacturer {
    fn id(&self) -> u16 {
        ID_MANUFACTURER
    }

    fn bytes(&self) -> [u8; FRAME_DLC] {
        self.name
    }
}
// }}}

// InverterSync 0x305 {{{
/// Inverter sync/acknowledge telegram, eight zero bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct InverterSync;

impl TelegramCommon for InverterSync {
    fn id(&self) -> u16 {
        ID_SYNC
    }

    fn bytes(&self) -> [u8; FRAME_DLC] {
        [0u8; FRAME_DLC]
    }
}
// }}}
