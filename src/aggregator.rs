//! Combines all input snapshots into the unified pack state.
//!
//! Driven by the snapshot-changed mailbox. A result is only published while
//! every input is complete and fresh; with partial data the inverters keep
//! running on the last state they saw rather than on a half-true one.

use std::time::Instant;

use crate::prelude::*;
use crate::pylontech::flags::StatusFlags;

#[derive(Clone)]
pub struct Aggregator {
    battery: config::Battery,
    inputs: Vec<watch::Receiver<BmsSnapshot>>,
    link: Arc<tokio::sync::Mutex<AggregatorLink>>,
    channels: Channels,
    stats: SharedStats,
}

impl Aggregator {
    pub fn new(
        battery: config::Battery,
        inputs: Vec<watch::Receiver<BmsSnapshot>>,
        link: AggregatorLink,
        channels: Channels,
        stats: SharedStats,
    ) -> Self {
        Self {
            battery,
            inputs,
            link: Arc::new(tokio::sync::Mutex::new(link)),
            channels,
            stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut shutdown = self.channels.shutdown.subscribe();
        let mut link = self.link.lock().await;
        let mut generation = link
            .unified_tx
            .borrow()
            .as_ref()
            .map_or(0, |state| state.generation);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("aggregator stopping");
                    return Ok(());
                }
                changed = link.mailbox.recv() => {
                    match changed {
                        Some(_) => self.recompute(&link.unified_tx, &mut generation),
                        // All input sessions gone; nothing left to aggregate.
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn recompute(
        &self,
        unified_tx: &watch::Sender<Option<UnifiedState>>,
        generation: &mut u64,
    ) {
        let now = Instant::now();
        let snapshots: Vec<BmsSnapshot> =
            self.inputs.iter().map(|rx| rx.borrow().clone()).collect();

        if !all_fresh(&snapshots, now) {
            debug!("aggregation suppressed, not all inputs fresh");
            return;
        }

        let capacity_total: f64 = snapshots.iter().map(|s| s.capacity_ah).sum();
        if capacity_total <= 0.0 {
            error!("total battery capacity is zero, check CAPACITY-AH settings");
            return;
        }

        *generation += 1;
        let state = reduce(&snapshots, &self.battery, *generation);
        if let Ok(mut stats) = self.stats.lock() {
            stats.aggregations += 1;
        }
        unified_tx.send_replace(Some(state));
    }
}

/// True iff every snapshot is complete and inside its freshness window.
pub fn all_fresh(snapshots: &[BmsSnapshot], now: Instant) -> bool {
    !snapshots.is_empty() && snapshots.iter().all(|s| s.complete && s.is_fresh(now))
}

/// The reduction itself. Pure; freshness gating and generation bookkeeping
/// happen in the caller.
pub fn reduce(
    snapshots: &[BmsSnapshot],
    battery: &config::Battery,
    generation: u64,
) -> UnifiedState {
    let capacity_total: f64 = snapshots.iter().map(|s| s.capacity_ah).sum();

    // End-of-charge voltage takes the lowest request, the low cutoff the
    // highest: the most conservative bound protects every module.
    let u_setpoint_charge = snapshots
        .iter()
        .map(|s| s.u_setpoint_charge)
        .fold(f64::INFINITY, f64::min);
    let u_setpoint_discharge = snapshots
        .iter()
        .map(|s| s.u_setpoint_discharge)
        .fold(f64::NEG_INFINITY, f64::max);

    // Current limits assume well-tuned current distribution across modules.
    let i_lim_charge = snapshots
        .iter()
        .map(|s| s.i_lim_charge)
        .sum::<f64>()
        .min(battery.i_lim_charge());
    let i_lim_discharge = snapshots
        .iter()
        .map(|s| s.i_lim_discharge)
        .sum::<f64>()
        .min(battery.i_lim_discharge());

    let i_measured = snapshots.iter().map(|s| s.i_measured).sum::<f64>()
        * battery.i_tot_scaling()
        + battery.i_tot_offset();

    let weighted = |field: fn(&BmsSnapshot) -> f64| {
        snapshots
            .iter()
            .map(|s| field(s) * s.capacity_ah)
            .sum::<f64>()
            / capacity_total
    };

    let error_flags = snapshots
        .iter()
        .map(|s| s.error_flags)
        .fold(Default::default(), |acc, f| acc | f);
    let warning_flags = snapshots
        .iter()
        .map(|s| s.warning_flags)
        .fold(Default::default(), |acc, f| acc | f);
    let status_flags = snapshots
        .iter()
        .map(|s| s.status_flags)
        .reduce(StatusFlags::combine)
        .unwrap_or_default();

    UnifiedState {
        generation,
        u_setpoint_charge,
        u_setpoint_discharge,
        i_lim_charge,
        i_lim_discharge,
        i_measured,
        u_measured: weighted(|s| s.u_measured),
        t_measured: weighted(|s| s.t_measured),
        soc: weighted(|s| s.soc),
        soh: weighted(|s| s.soh),
        capacity_total_ah: capacity_total,
        n_modules: snapshots
            .iter()
            .map(|s| u16::from(s.n_modules))
            .fold(0, u16::saturating_add),
        manufacturer: snapshots[0].manufacturer.clone(),
        error_flags,
        warning_flags,
        status_flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pylontech::flags::{ErrorFlags, StatusFlags};
    use std::time::Duration;

    fn battery() -> config::Battery {
        toml::from_str(
            r#"
I-LIM-CHARGE = 700.0
I-LIM-DISCHARGE = 700.0
"#,
        )
        .unwrap()
    }

    fn snap(capacity_ah: f64) -> BmsSnapshot {
        let mut s = BmsSnapshot::new("test", capacity_ah, Duration::from_secs(3));
        s.u_setpoint_charge = 56.0;
        s.u_setpoint_discharge = 44.0;
        s.i_lim_charge = 100.0;
        s.i_lim_discharge = 100.0;
        s.u_measured = 52.0;
        s.i_measured = 10.0;
        s.t_measured = 20.0;
        s.soc = 50.0;
        s.soh = 100.0;
        s.n_modules = 2;
        s.status_flags = StatusFlags::from_bits(
            StatusFlags::CHARGE_ENABLE | StatusFlags::DISCHARGE_ENABLE,
        );
        s.complete = true;
        s
    }

    #[test]
    fn soc_is_capacity_weighted() {
        let mut a = snap(100.0);
        a.soc = 40.0;
        let mut b = snap(300.0);
        b.soc = 80.0;

        let state = reduce(&[a, b], &battery(), 1);
        assert_eq!(state.soc, 70.0);
        assert_eq!(state.capacity_total_ah, 400.0);
        assert_eq!(state.generation, 1);
    }

    #[test]
    fn voltage_setpoints_take_safe_extremes() {
        let mut a = snap(100.0);
        a.u_setpoint_charge = 55.0;
        a.u_setpoint_discharge = 42.0;
        let mut b = snap(100.0);
        b.u_setpoint_charge = 56.0;
        b.u_setpoint_discharge = 44.5;

        let state = reduce(&[a, b], &battery(), 1);
        assert_eq!(state.u_setpoint_charge, 55.0);
        assert_eq!(state.u_setpoint_discharge, 44.5);
    }

    #[test]
    fn current_limits_sum_then_clamp() {
        let mut a = snap(100.0);
        a.i_lim_charge = 400.0;
        let mut b = snap(100.0);
        b.i_lim_charge = 400.0;

        let state = reduce(&[a.clone(), b], &battery(), 1);
        // 800 summed, clamped to the pack limit of 700
        assert_eq!(state.i_lim_charge, 700.0);
        assert!(state.i_lim_charge <= battery().i_lim_charge());

        let state = reduce(&[a], &battery(), 1);
        assert_eq!(state.i_lim_charge, 400.0);
    }

    #[test]
    fn total_current_scaling_and_offset() {
        let batt: config::Battery = toml::from_str(
            r#"
I-TOT-SCALING = 0.5
I-TOT-OFFSET = 2.0
"#,
        )
        .unwrap();

        let mut a = snap(100.0);
        a.i_measured = 10.0;
        let mut b = snap(100.0);
        b.i_measured = 30.0;

        let state = reduce(&[a, b], &batt, 1);
        assert_eq!(state.i_measured, 22.0);
    }

    #[test]
    fn flags_or_and_enables_and() {
        let mut a = snap(100.0);
        a.error_flags = ErrorFlags::from_bits(ErrorFlags::OVERVOLTAGE);
        let mut b = snap(100.0);
        b.error_flags = ErrorFlags::from_bits(ErrorFlags::TEMPERATURE_HIGH);
        b.status_flags = StatusFlags::from_bits(
            StatusFlags::CHARGE_ENABLE | StatusFlags::FORCE_CHARGE_1,
        );

        let state = reduce(&[a, b], &battery(), 1);
        assert!(state.error_flags.contains(ErrorFlags::OVERVOLTAGE));
        assert!(state.error_flags.contains(ErrorFlags::TEMPERATURE_HIGH));
        assert!(state.status_flags.charge_enable());
        // b does not enable discharging, so the pack does not either
        assert!(!state.status_flags.discharge_enable());
        assert!(state.status_flags.contains(StatusFlags::FORCE_CHARGE_1));
    }

    #[test]
    fn modules_and_manufacturer() {
        let mut a = snap(100.0);
        a.manufacturer = "PYLON".to_string();
        let mut b = snap(100.0);
        b.manufacturer = "OTHER".to_string();
        b.n_modules = 5;

        let state = reduce(&[a, b], &battery(), 1);
        assert_eq!(state.n_modules, 7);
        assert_eq!(state.manufacturer, "PYLON");
    }

    #[test]
    fn reduction_is_deterministic() {
        let a = snap(100.0);
        let b = snap(250.0);
        let first = reduce(&[a.clone(), b.clone()], &battery(), 7);
        let second = reduce(&[a, b], &battery(), 7);
        assert_eq!(first, second);
    }

    #[test]
    fn freshness_gate_blocks_on_one_stale_input() {
        use crate::pylontech::telegram::{Alarms, ChargeParams, Measurements, SocSoh};
        use std::time::Instant;

        let feed = |s: &mut BmsSnapshot, at: Instant| {
            s.apply(
                &ChargeParams {
                    u_charge: 55.0,
                    i_lim_charge: 100.0,
                    i_lim_discharge: 100.0,
                    u_discharge: 44.0,
                }
                .into(),
                at,
            );
            s.apply(&SocSoh { soc: 50, soh: 100 }.into(), at);
            s.apply(
                &Measurements {
                    u: 52.0,
                    i: 0.0,
                    t: 20.0,
                }
                .into(),
                at,
            );
            s.apply(
                &Alarms {
                    errors: Default::default(),
                    warnings: Default::default(),
                    n_modules: 1,
                }
                .into(),
                at,
            );
        };

        let start = Instant::now();
        let mut a = BmsSnapshot::new("a", 100.0, Duration::from_secs(3));
        let mut b = BmsSnapshot::new("b", 100.0, Duration::from_secs(3));
        feed(&mut a, start);
        feed(&mut b, start);
        assert!(all_fresh(&[a.clone(), b.clone()], start));

        // b goes quiet past its window, a keeps updating
        let later = start + Duration::from_secs(4);
        feed(&mut a, later);
        assert!(!all_fresh(&[a.clone(), b.clone()], later));

        // b resumes
        feed(&mut b, later);
        assert!(all_fresh(&[a, b], later));
    }

    #[test]
    fn incomplete_input_blocks() {
        let mut a = snap(100.0);
        let b = BmsSnapshot::new("empty", 100.0, Duration::from_secs(3));
        a.complete = true;
        assert!(!all_fresh(&[a, b], Instant::now()));
    }
}
