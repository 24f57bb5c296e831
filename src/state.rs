//! Per-input BMS snapshots and the unified pack state.

use std::time::{Duration, Instant};

use crate::pylontech::flags::{ErrorFlags, StatusFlags, WarningFlags};
use crate::pylontech::telegram::Telegram;

/// Telegram groups making up one BMS state broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramGroup {
    ChargeParams,
    SocSoh,
    Measurements,
    Alarms,
    Status,
    Manufacturer,
}

impl TelegramGroup {
    pub const COUNT: usize = 6;

    /// Groups that must all have been seen before a snapshot is usable.
    pub const REQUIRED: [TelegramGroup; 4] = [
        TelegramGroup::ChargeParams,
        TelegramGroup::SocSoh,
        TelegramGroup::Measurements,
        TelegramGroup::Alarms,
    ];

    fn index(self) -> usize {
        match self {
            TelegramGroup::ChargeParams => 0,
            TelegramGroup::SocSoh => 1,
            TelegramGroup::Measurements => 2,
            TelegramGroup::Alarms => 3,
            TelegramGroup::Status => 4,
            TelegramGroup::Manufacturer => 5,
        }
    }
}

// BmsSnapshot {{{
/// Decoded view of one input BMS. Owned by its input session; everybody
/// else sees clones through the snapshot watch.
#[derive(Debug, Clone)]
pub struct BmsSnapshot {
    pub desc: String,
    /// Pack capacity from configuration, the aggregation weight.
    pub capacity_ah: f64,
    pub freshness_window: Duration,

    pub u_setpoint_charge: f64,
    pub u_setpoint_discharge: f64,
    pub i_lim_charge: f64,
    pub i_lim_discharge: f64,
    pub u_measured: f64,
    pub i_measured: f64,
    pub t_measured: f64,
    pub soc: f64,
    pub soh: f64,
    pub n_modules: u8,
    pub manufacturer: String,

    pub error_flags: ErrorFlags,
    pub warning_flags: WarningFlags,
    pub status_flags: StatusFlags,

    created: Instant,
    last_seen: [Option<Instant>; TelegramGroup::COUNT],
    /// Last 0x305 observed on this input bus, if any.
    pub last_inverter_request: Option<Instant>,

    /// Set once the full required group set has been received. Never
    /// reverts; later partial updates mutate fields in place.
    pub complete: bool,
    /// Housekeeping flag: required groups have gone quiet. The data is
    /// kept, only its use is gated.
    pub stale: bool,
    pub invalid_frames: u64,
}

impl BmsSnapshot {
    pub fn new(desc: &str, capacity_ah: f64, freshness_window: Duration) -> Self {
        Self {
            desc: desc.to_string(),
            capacity_ah,
            freshness_window,
            u_setpoint_charge: 0.0,
            u_setpoint_discharge: 0.0,
            i_lim_charge: 0.0,
            i_lim_discharge: 0.0,
            u_measured: 0.0,
            i_measured: 0.0,
            t_measured: 0.0,
            soc: 0.0,
            soh: 0.0,
            n_modules: 0,
            manufacturer: String::new(),
            error_flags: ErrorFlags::default(),
            warning_flags: WarningFlags::default(),
            status_flags: StatusFlags::default(),
            created: Instant::now(),
            last_seen: [None; TelegramGroup::COUNT],
            last_inverter_request: None,
            complete: false,
            stale: false,
            invalid_frames: 0,
        }
    }

    /// Fold one decoded telegram into the snapshot.
    pub fn apply(&mut self, telegram: &Telegram, now: Instant) {
        match telegram {
            Telegram::ChargeParams(t) => {
                self.u_setpoint_charge = t.u_charge;
                self.u_setpoint_discharge = t.u_discharge;
                self.i_lim_charge = t.i_lim_charge;
                self.i_lim_discharge = t.i_lim_discharge;
                self.mark_seen(TelegramGroup::ChargeParams, now);
            }
            Telegram::SocSoh(t) => {
                self.soc = f64::from(t.soc).clamp(0.0, 100.0);
                self.soh = f64::from(t.soh).clamp(0.0, 100.0);
                self.mark_seen(TelegramGroup::SocSoh, now);
            }
            Telegram::Measurements(t) => {
                self.u_measured = t.u;
                self.i_measured = t.i;
                self.t_measured = t.t;
                self.mark_seen(TelegramGroup::Measurements, now);
            }
            Telegram::Alarms(t) => {
                self.error_flags = t.errors;
                self.warning_flags = t.warnings;
                self.n_modules = t.n_modules;
                self.mark_seen(TelegramGroup::Alarms, now);
            }
            Telegram::Status(t) => {
                self.status_flags = t.flags;
                self.mark_seen(TelegramGroup::Status, now);
            }
            Telegram::Manufacturer(t) => {
                self.manufacturer = t.as_str().to_string();
                self.mark_seen(TelegramGroup::Manufacturer, now);
            }
            Telegram::InverterSync(_) => {
                self.last_inverter_request = Some(now);
            }
        }
    }

    fn mark_seen(&mut self, group: TelegramGroup, now: Instant) {
        self.last_seen[group.index()] = Some(now);
        if !self.complete {
            self.complete = TelegramGroup::REQUIRED
                .iter()
                .all(|g| self.last_seen[g.index()].is_some());
        }
    }

    /// True iff every required group was seen within the freshness window.
    pub fn is_fresh(&self, now: Instant) -> bool {
        TelegramGroup::REQUIRED.iter().all(|g| {
            self.last_seen[g.index()]
                .is_some_and(|seen| now.duration_since(seen) <= self.freshness_window)
        })
    }

    /// Age of the oldest required group, falling back to the snapshot age
    /// while nothing has been received yet.
    pub fn last_seen_age(&self, now: Instant) -> Duration {
        TelegramGroup::REQUIRED
            .iter()
            .map(|g| {
                self.last_seen[g.index()]
                    .map_or_else(|| now.duration_since(self.created), |seen| now.duration_since(seen))
            })
            .max()
            .unwrap_or_default()
    }
}
// }}}

// UnifiedState {{{
/// The aggregated pack state, one virtual BMS standing in for all inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedState {
    /// Increments on every recomputation.
    pub generation: u64,

    pub u_setpoint_charge: f64,
    pub u_setpoint_discharge: f64,
    pub i_lim_charge: f64,
    pub i_lim_discharge: f64,
    pub u_measured: f64,
    pub i_measured: f64,
    pub t_measured: f64,
    pub soc: f64,
    pub soh: f64,
    pub capacity_total_ah: f64,
    pub n_modules: u16,
    pub manufacturer: String,

    pub error_flags: ErrorFlags,
    pub warning_flags: WarningFlags,
    pub status_flags: StatusFlags,
}
// }}}
