use std::time::Duration;

use anyhow::{anyhow, Result};
use socketcan::{CanDataFrame, CanFrame, EmbeddedFrame, Id};

use crate::pylontech::telegram::{Telegram, TelegramCommon};

/// Exponential retry backoff, doubling from `start` up to `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    start: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(start: Duration, cap: Duration) -> Self {
        Self {
            start,
            cap,
            current: start,
        }
    }

    /// Delay to wait now; doubles the next one.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.start;
    }
}

/// Wall-clock time as fractional epoch seconds, for telemetry timestamps.
pub fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Build the socketcan frame for a telegram.
pub fn to_can_frame(telegram: &Telegram) -> Result<CanFrame> {
    let id = socketcan::StandardId::new(telegram.id())
        .ok_or_else(|| anyhow!("CAN id {:#x} outside the standard range", telegram.id()))?;
    let frame = CanDataFrame::new(id, &telegram.bytes())
        .ok_or_else(|| anyhow!("payload too long for one CAN frame"))?;
    Ok(CanFrame::Data(frame))
}

/// Identifier and payload of a standard-id data frame. Extended, remote and
/// error frames yield `None`; none of them belong to the telegram family.
pub fn standard_frame_parts(frame: &CanFrame) -> Option<(u16, &[u8])> {
    match frame {
        CanFrame::Data(data_frame) => match data_frame.id() {
            Id::Standard(id) => Some((id.as_raw(), data_frame.data())),
            Id::Extended(_) => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(250), Duration::from_secs(5));
        assert_eq!(b.next(), Duration::from_millis(250));
        assert_eq!(b.next(), Duration::from_millis(500));
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(2));
        assert_eq!(b.next(), Duration::from_secs(4));
        assert_eq!(b.next(), Duration::from_secs(5));
        assert_eq!(b.next(), Duration::from_secs(5));
        b.reset();
        assert_eq!(b.next(), Duration::from_millis(250));
    }
}
