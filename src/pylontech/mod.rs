//! Pylontech / SMA Sunny Island LV protocol over CAN.
//!
//! `telegram` holds the pure frame codec, `flags` the protection, alarm and
//! request bitsets carried in telegrams 0x359 and 0x35C.

pub mod flags;
pub mod telegram;
