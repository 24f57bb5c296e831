use crate::prelude::*;

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR_NAME: &str = ".bms_gateway";
pub const CONFIG_FILE_NAME: &str = "bms_gateway.toml";

const DEFAULT_CONFIG: &str = include_str!("bms_gateway_default.toml");

// Nominal BMS broadcast period; an input without explicit polling is
// considered stale after three missed periods.
const NOMINAL_TRANSMIT_PERIOD: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "GATEWAY-ACTIVATED")]
    gateway_activated: bool,

    mqtt: Mqtt,
    battery: Battery,

    #[serde(rename = "bmses-in", default)]
    bmses_in: Vec<BmsIn>,
    #[serde(rename = "bmses-out", default)]
    bmses_out: Vec<BmsOut>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| config_error!("cannot read {}: {}", path.display(), err))?;
        let config: Config = toml::from_str(&text)
            .map_err(|err| config_error!("cannot parse {}: {}", path.display(), err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn gateway_activated(&self) -> bool {
        self.gateway_activated
    }

    pub fn mqtt(&self) -> &Mqtt {
        &self.mqtt
    }

    pub fn battery(&self) -> &Battery {
        &self.battery
    }

    pub fn bmses_in(&self) -> &[BmsIn] {
        &self.bmses_in
    }

    pub fn bmses_out(&self) -> &[BmsOut] {
        &self.bmses_out
    }

    fn validate(&self) -> Result<()> {
        if self.bmses_in.is_empty() {
            return Err(config_error!("no [[bmses-in]] entries configured"));
        }
        if self.bmses_out.is_empty() {
            return Err(config_error!("no [[bmses-out]] entries configured"));
        }

        let mut interfaces = HashSet::new();
        for can_if in self
            .bmses_in
            .iter()
            .map(|b| b.can_if())
            .chain(self.bmses_out.iter().map(|b| b.can_if()))
        {
            if can_if.is_empty() {
                return Err(config_error!("empty CAN-IF entry"));
            }
            if !interfaces.insert(can_if) {
                return Err(config_error!("CAN interface {} configured twice", can_if));
            }
        }

        for bms in &self.bmses_in {
            if bms.capacity_ah() <= 0.0 {
                return Err(config_error!(
                    "CAPACITY-AH for {} must be positive",
                    bms.description()
                ));
            }
            if bms.poll_interval_s.is_some_and(|v| v <= 0.0) {
                return Err(config_error!(
                    "POLL-INTERVAL for {} must be positive",
                    bms.description()
                ));
            }
        }
        let total: f64 = self.bmses_in.iter().map(|b| b.capacity_ah()).sum();
        if total <= 0.0 {
            return Err(config_error!("total battery capacity is zero"));
        }

        for bms in &self.bmses_out {
            if bms.sync_interval_s <= 0.0 {
                return Err(config_error!(
                    "SYNC-INTERVAL for {} must be positive",
                    bms.description()
                ));
            }
            if bms.push_min_delay_s < 0.0 {
                return Err(config_error!(
                    "PUSH-MIN-DELAY for {} must not be negative",
                    bms.description()
                ));
            }
        }

        if self.mqtt.interval_s <= 0.0 {
            return Err(config_error!("[mqtt] INTERVAL must be positive"));
        }

        Ok(())
    }
}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(rename = "ACTIVATED", default = "Config::default_activated")]
    activated: bool,

    #[serde(rename = "TOPIC", default = "Config::default_mqtt_topic")]
    topic: String,

    #[serde(rename = "BROKER", default = "Config::default_mqtt_broker")]
    broker: String,

    #[serde(rename = "PORT", default = "Config::default_mqtt_port")]
    port: u16,

    #[serde(rename = "INTERVAL", default = "Config::default_mqtt_interval")]
    interval_s: f64,
}

impl Mqtt {
    pub fn activated(&self) -> bool {
        self.activated
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_s)
    }
}
// }}}

// Battery {{{
/// Totals for the whole parallel pack, applied after aggregation.
#[derive(Clone, Debug, Deserialize)]
pub struct Battery {
    #[serde(rename = "I-LIM-CHARGE", default = "Config::default_i_lim")]
    i_lim_charge: f64,

    #[serde(rename = "I-LIM-DISCHARGE", default = "Config::default_i_lim")]
    i_lim_discharge: f64,

    #[serde(rename = "I-TOT-SCALING", default = "Config::default_scaling")]
    i_tot_scaling: f64,

    #[serde(rename = "I-TOT-OFFSET", default = "Config::default_offset")]
    i_tot_offset: f64,
}

impl Battery {
    pub fn i_lim_charge(&self) -> f64 {
        self.i_lim_charge
    }

    pub fn i_lim_discharge(&self) -> f64 {
        self.i_lim_discharge
    }

    pub fn i_tot_scaling(&self) -> f64 {
        self.i_tot_scaling
    }

    pub fn i_tot_offset(&self) -> f64 {
        self.i_tot_offset
    }
}
// }}}

// BmsIn {{{
#[derive(Clone, Debug, Deserialize)]
pub struct BmsIn {
    #[serde(rename = "CAN-IF")]
    can_if: String,

    #[serde(rename = "DESCRIPTION", default = "Config::default_in_description")]
    description: String,

    /// Weighting factor for SOC, SOH, voltage and temperature averages.
    #[serde(rename = "CAPACITY-AH")]
    capacity_ah: f64,

    /// When set, the BMS is polled by sending a sync telegram at this
    /// interval in seconds.
    #[serde(rename = "POLL-INTERVAL", default)]
    poll_interval_s: Option<f64>,
}

impl BmsIn {
    pub fn can_if(&self) -> &str {
        &self.can_if
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn capacity_ah(&self) -> f64 {
        self.capacity_ah
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_s.map(Duration::from_secs_f64)
    }

    /// Three transmit periods without a full group set means stale.
    pub fn freshness_window(&self) -> Duration {
        3 * self
            .poll_interval()
            .unwrap_or(NOMINAL_TRANSMIT_PERIOD)
    }
}
// }}}

// BmsOut {{{
#[derive(Clone, Debug, Deserialize)]
pub struct BmsOut {
    #[serde(rename = "CAN-IF")]
    can_if: String,

    #[serde(rename = "DESCRIPTION", default = "Config::default_out_description")]
    description: String,

    #[serde(rename = "I-LIM-CHARGE", default = "Config::default_i_lim")]
    i_lim_charge: f64,

    #[serde(rename = "I-LIM-DISCHARGE", default = "Config::default_i_lim")]
    i_lim_discharge: f64,

    /// Share of the total current reported to this inverter. Usually the
    /// inverter's power divided by the total power of all inverters.
    #[serde(rename = "I-SCALING", default = "Config::default_scaling")]
    i_scaling: f64,

    #[serde(rename = "I-OFFSET", default = "Config::default_offset")]
    i_offset: f64,

    /// Minimum delay between two push-mode emissions in seconds; newer
    /// states win, intermediate ones are dropped.
    #[serde(rename = "PUSH-MIN-DELAY", default = "Config::default_offset")]
    push_min_delay_s: f64,

    /// Reply to inverter sync telegrams instead of pushing, and send our
    /// own sync telegram periodically.
    #[serde(rename = "SEND-SYNC-ACTIVATED", default)]
    send_sync_activated: bool,

    #[serde(rename = "SYNC-INTERVAL", default = "Config::default_sync_interval")]
    sync_interval_s: f64,
}

impl BmsOut {
    pub fn can_if(&self) -> &str {
        &self.can_if
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn i_lim_charge(&self) -> f64 {
        self.i_lim_charge
    }

    pub fn i_lim_discharge(&self) -> f64 {
        self.i_lim_discharge
    }

    pub fn i_scaling(&self) -> f64 {
        self.i_scaling
    }

    pub fn i_offset(&self) -> f64 {
        self.i_offset
    }

    pub fn push_min_delay(&self) -> Duration {
        Duration::from_secs_f64(self.push_min_delay_s)
    }

    pub fn send_sync_activated(&self) -> bool {
        self.send_sync_activated
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sync_interval_s)
    }
}
// }}}

impl Config {
    fn default_activated() -> bool {
        true
    }

    fn default_mqtt_topic() -> String {
        "tele/bms/state".to_string()
    }

    fn default_mqtt_broker() -> String {
        "localhost".to_string()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_interval() -> f64 {
        10.0
    }

    fn default_i_lim() -> f64 {
        300.0
    }

    fn default_scaling() -> f64 {
        1.0
    }

    fn default_offset() -> f64 {
        0.0
    }

    fn default_sync_interval() -> f64 {
        5.0
    }

    fn default_in_description() -> String {
        "Battery BMS".to_string()
    }

    fn default_out_description() -> String {
        "Virtual BMS".to_string()
    }
}

/// `~/.bms_gateway/bms_gateway.toml`
pub fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .ok_or_else(|| config_error!("HOME is not set, cannot locate the config file"))?;
    Ok(PathBuf::from(home)
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME))
}

/// Copy the built-in template to `path` for the operator to edit.
pub fn init_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| config_error!("cannot create {}: {}", parent.display(), err))?;
    }
    fs::write(path, DEFAULT_CONFIG)
        .map_err(|err| config_error!("cannot write {}: {}", path.display(), err))?;
    info!(
        "configuration template written to {} - edit it to match the CAN hardware, then start the gateway again",
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> String {
        r#"
GATEWAY-ACTIVATED = true

[mqtt]
TOPIC = "tele/bms/state"
BROKER = "localhost"

[battery]
I-LIM-CHARGE = 700.0
I-LIM-DISCHARGE = 700.0

[[bmses-in]]
CAN-IF = "can_in_1"
DESCRIPTION = "Rack left"
CAPACITY-AH = 100.0

[[bmses-in]]
CAN-IF = "can_in_2"
DESCRIPTION = "Rack right"
CAPACITY-AH = 300.0
POLL-INTERVAL = 2.0

[[bmses-out]]
CAN-IF = "can_out_1"
I-LIM-CHARGE = 400.0
I-SCALING = 0.5
"#
        .to_string()
    }

    #[test]
    fn parses_recognized_keys() {
        let config: Config = toml::from_str(&minimal()).unwrap();
        config.validate().unwrap();

        assert!(config.gateway_activated());
        assert_eq!(config.battery().i_lim_charge(), 700.0);
        assert_eq!(config.battery().i_tot_scaling(), 1.0);

        assert_eq!(config.bmses_in().len(), 2);
        assert_eq!(config.bmses_in()[0].capacity_ah(), 100.0);
        assert_eq!(config.bmses_in()[0].poll_interval(), None);
        assert_eq!(
            config.bmses_in()[1].poll_interval(),
            Some(Duration::from_secs(2))
        );

        let out = &config.bmses_out()[0];
        assert_eq!(out.i_lim_charge(), 400.0);
        assert_eq!(out.i_scaling(), 0.5);
        assert!(!out.send_sync_activated());
        assert_eq!(out.sync_interval(), Duration::from_secs(5));
    }

    #[test]
    fn freshness_window_tracks_poll_interval() {
        let config: Config = toml::from_str(&minimal()).unwrap();
        assert_eq!(
            config.bmses_in()[0].freshness_window(),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.bmses_in()[1].freshness_window(),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn mqtt_defaults() {
        let config: Config = toml::from_str(&minimal()).unwrap();
        assert!(config.mqtt().activated());
        assert_eq!(config.mqtt().port(), 1883);
        assert_eq!(config.mqtt().interval(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_zero_capacity() {
        let text = minimal().replace("CAPACITY-AH = 100.0", "CAPACITY-AH = 0.0");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_interface() {
        let text = minimal().replace("CAN-IF = \"can_in_2\"", "CAN-IF = \"can_in_1\"");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_inputs() {
        let text = r#"
GATEWAY-ACTIVATED = true
[mqtt]
[battery]
[[bmses-out]]
CAN-IF = "can_out_1"
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn template_parses_and_validates() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.validate().unwrap();
        assert!(!config.gateway_activated());
    }
}
