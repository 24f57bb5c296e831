use crate::prelude::*;

pub type SharedStats = Arc<Mutex<GatewayStats>>;

/// Process-wide counters, printed once at shutdown.
#[derive(Default)]
pub struct GatewayStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub decode_errors: u64,
    pub send_errors: u64,
    pub aggregations: u64,
    pub mqtt_published: u64,
    pub mqtt_errors: u64,
}

impl GatewayStats {
    pub fn shared() -> SharedStats {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn print_summary(&self) {
        info!("Gateway statistics:");
        info!("  CAN frames received: {}", self.frames_received);
        info!("  CAN frames sent: {}", self.frames_sent);
        info!("  Decode errors: {}", self.decode_errors);
        info!("  Send errors: {}", self.send_errors);
        info!("  Aggregations: {}", self.aggregations);
        info!("  MQTT messages published: {}", self.mqtt_published);
        info!("  MQTT errors: {}", self.mqtt_errors);
    }
}
