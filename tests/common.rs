use std::time::{Duration, Instant};

use bms_gateway::prelude::*;
use bms_gateway::pylontech::telegram::{Alarms, ChargeParams, Measurements, SocSoh};

pub struct Factory;

impl Factory {
    pub fn battery() -> bms_gateway::config::Battery {
        toml::from_str(
            r#"
I-LIM-CHARGE = 700.0
I-LIM-DISCHARGE = 700.0
"#,
        )
        .unwrap()
    }

    pub fn snapshot(desc: &str, capacity_ah: f64, window: Duration) -> BmsSnapshot {
        BmsSnapshot::new(desc, capacity_ah, window)
    }

    /// Feed the full required telegram group, as one BMS broadcast cycle.
    pub fn feed(
        snapshot: &mut BmsSnapshot,
        soc: u16,
        u: f64,
        i: f64,
        u_charge: f64,
        i_lim: f64,
        at: Instant,
    ) {
        snapshot.apply(
            &ChargeParams {
                u_charge,
                i_lim_charge: i_lim,
                i_lim_discharge: i_lim,
                u_discharge: 44.0,
            }
            .into(),
            at,
        );
        snapshot.apply(&SocSoh { soc, soh: 100 }.into(), at);
        snapshot.apply(&Measurements { u, i, t: 20.0 }.into(), at);
        snapshot.apply(
            &Alarms {
                errors: Default::default(),
                warnings: Default::default(),
                n_modules: 1,
            }
            .into(),
            at,
        );
    }
}
