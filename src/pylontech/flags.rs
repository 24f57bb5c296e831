//! Protection, alarm and request bitsets.
//!
//! Bit positions as seen on the wire. Telegram 0x359 carries the protection
//! (error) set in bytes 0-1 and the alarm (warning) set in bytes 2-3, low
//! byte first. Telegram 0x35C carries the request set in byte 0.
//!
//! Error set:   byte 0: bit 7 overcurrent discharge, bit 4 temperature low,
//!              bit 3 temperature high, bit 2 undervoltage, bit 1 overvoltage
//!              byte 1: bit 3 system error, bit 0 overcurrent charge
//! Warning set: same positions, byte 1 bit 3 is communication error
//! Status set:  bit 7 charge enable, bit 6 discharge enable,
//!              bit 5 force charge I, bit 4 force charge II,
//!              bit 3 request full charge
//!
//! Bits without a name are carried through unchanged so that OR-combining
//! states never loses information.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

// ErrorFlags {{{
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorFlags(u16);

impl ErrorFlags {
    pub const OVERCURRENT_DISCHARGE: u16 = 1 << 7;
    pub const TEMPERATURE_LOW: u16 = 1 << 4;
    pub const TEMPERATURE_HIGH: u16 = 1 << 3;
    pub const UNDERVOLTAGE: u16 = 1 << 2;
    pub const OVERVOLTAGE: u16 = 1 << 1;
    pub const SYSTEM_ERROR: u16 = 1 << 11;
    pub const OVERCURRENT_CHARGE: u16 = 1 << 8;

    const NAMES: [(u16, &'static str); 7] = [
        (Self::OVERCURRENT_DISCHARGE, "overcurrent_discharge"),
        (Self::OVERCURRENT_CHARGE, "overcurrent_charge"),
        (Self::OVERVOLTAGE, "overvoltage"),
        (Self::UNDERVOLTAGE, "undervoltage"),
        (Self::TEMPERATURE_HIGH, "temperature_high"),
        (Self::TEMPERATURE_LOW, "temperature_low"),
        (Self::SYSTEM_ERROR, "system_error"),
    ];

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Wire order: low byte first (0x359 bytes 0 and 1).
    pub fn from_bytes(lo: u8, hi: u8) -> Self {
        Self(u16::from_le_bytes([lo, hi]))
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, mask: u16) -> bool {
        self.0 & mask != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn active_names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(mask, _)| self.contains(*mask))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for ErrorFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorFlags({:#06x})", self.0)
    }
}
// }}}

// WarningFlags {{{
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct WarningFlags(u16);

impl WarningFlags {
    pub const OVERCURRENT_DISCHARGE: u16 = 1 << 7;
    pub const TEMPERATURE_LOW: u16 = 1 << 4;
    pub const TEMPERATURE_HIGH: u16 = 1 << 3;
    pub const UNDERVOLTAGE: u16 = 1 << 2;
    pub const OVERVOLTAGE: u16 = 1 << 1;
    pub const COMMUNICATION_ERROR: u16 = 1 << 11;
    pub const OVERCURRENT_CHARGE: u16 = 1 << 8;

    const NAMES: [(u16, &'static str); 7] = [
        (Self::OVERCURRENT_DISCHARGE, "overcurrent_discharge"),
        (Self::OVERCURRENT_CHARGE, "overcurrent_charge"),
        (Self::OVERVOLTAGE, "overvoltage"),
        (Self::UNDERVOLTAGE, "undervoltage"),
        (Self::TEMPERATURE_HIGH, "temperature_high"),
        (Self::TEMPERATURE_LOW, "temperature_low"),
        (Self::COMMUNICATION_ERROR, "communication_error"),
    ];

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn from_bytes(lo: u8, hi: u8) -> Self {
        Self(u16::from_le_bytes([lo, hi]))
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, mask: u16) -> bool {
        self.0 & mask != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn active_names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(mask, _)| self.contains(*mask))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for WarningFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for WarningFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for WarningFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WarningFlags({:#06x})", self.0)
    }
}
// }}}

// StatusFlags {{{
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags(u8);

impl StatusFlags {
    pub const CHARGE_ENABLE: u8 = 1 << 7;
    pub const DISCHARGE_ENABLE: u8 = 1 << 6;
    pub const FORCE_CHARGE_1: u8 = 1 << 5;
    pub const FORCE_CHARGE_2: u8 = 1 << 4;
    pub const REQUEST_FULL_CHARGE: u8 = 1 << 3;

    const ENABLE_MASK: u8 = Self::CHARGE_ENABLE | Self::DISCHARGE_ENABLE;

    const NAMES: [(u8, &'static str); 5] = [
        (Self::CHARGE_ENABLE, "charge_enable"),
        (Self::DISCHARGE_ENABLE, "discharge_enable"),
        (Self::FORCE_CHARGE_1, "force_charge_1"),
        (Self::FORCE_CHARGE_2, "force_charge_2"),
        (Self::REQUEST_FULL_CHARGE, "request_full_charge"),
    ];

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    pub fn charge_enable(self) -> bool {
        self.contains(Self::CHARGE_ENABLE)
    }

    pub fn discharge_enable(self) -> bool {
        self.contains(Self::DISCHARGE_ENABLE)
    }

    /// Combine two module states into the pack state: enables require
    /// unanimity, request bits (named or not) accumulate.
    pub fn combine(self, other: Self) -> Self {
        let enables = self.0 & other.0 & Self::ENABLE_MASK;
        let requests = (self.0 | other.0) & !Self::ENABLE_MASK;
        Self(enables | requests)
    }

    pub fn named_entries(self) -> [(&'static str, bool); 5] {
        Self::NAMES.map(|(mask, name)| (name, self.contains(mask)))
    }
}

impl fmt::Debug for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusFlags({:#04x})", self.0)
    }
}
// }}}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_flag_positions_match_the_wire() {
        let flags = ErrorFlags::from_bytes(0b1000_0110, 0b0000_1001);
        assert!(flags.contains(ErrorFlags::OVERCURRENT_DISCHARGE));
        assert!(flags.contains(ErrorFlags::UNDERVOLTAGE));
        assert!(flags.contains(ErrorFlags::OVERVOLTAGE));
        assert!(flags.contains(ErrorFlags::SYSTEM_ERROR));
        assert!(flags.contains(ErrorFlags::OVERCURRENT_CHARGE));
        assert!(!flags.contains(ErrorFlags::TEMPERATURE_HIGH));
        assert_eq!(flags.to_bytes(), [0b1000_0110, 0b0000_1001]);
    }

    #[test]
    fn unknown_bits_survive_or_combination() {
        let known = ErrorFlags::from_bits(ErrorFlags::OVERVOLTAGE);
        let unknown = ErrorFlags::from_bits(1 << 14);
        let both = known | unknown;
        assert_eq!(both.bits(), ErrorFlags::OVERVOLTAGE | 1 << 14);
        // Only the named bit shows up in the report.
        assert_eq!(both.active_names(), vec!["overvoltage"]);
    }

    #[test]
    fn warning_names_list_active_bits() {
        let flags =
            WarningFlags::from_bits(WarningFlags::TEMPERATURE_HIGH | WarningFlags::COMMUNICATION_ERROR);
        let names = flags.active_names();
        assert_eq!(names, vec!["temperature_high", "communication_error"]);
    }

    #[test]
    fn status_combine_requires_unanimous_enable() {
        let a = StatusFlags::from_bits(
            StatusFlags::CHARGE_ENABLE | StatusFlags::DISCHARGE_ENABLE,
        );
        let b = StatusFlags::from_bits(
            StatusFlags::CHARGE_ENABLE | StatusFlags::REQUEST_FULL_CHARGE,
        );
        let combined = a.combine(b);
        assert!(combined.charge_enable());
        assert!(!combined.discharge_enable());
        assert!(combined.contains(StatusFlags::REQUEST_FULL_CHARGE));
    }

    #[test]
    fn status_combine_accumulates_requests() {
        let a = StatusFlags::from_bits(StatusFlags::FORCE_CHARGE_1);
        let b = StatusFlags::from_bits(StatusFlags::FORCE_CHARGE_2 | 1 << 0);
        let combined = a.combine(b);
        assert!(combined.contains(StatusFlags::FORCE_CHARGE_1));
        assert!(combined.contains(StatusFlags::FORCE_CHARGE_2));
        // Unnamed request bit rides along.
        assert!(combined.contains(1 << 0));
    }
}
