//! Telemetry publisher: unified pack state as JSON over MQTT.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, QoS};
use serde::Serialize;

use crate::prelude::*;
use crate::utils::epoch_seconds;

const CLIENT_ID: &str = "bms-gateway";
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_START: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

// Telemetry {{{
/// One telemetry message. Field names are the wire schema.
#[derive(Serialize)]
struct Telemetry {
    gen: u64,
    ts: f64,
    u_charge: f64,
    u_discharge: f64,
    i_lim_charge: f64,
    i_lim_discharge: f64,
    u: f64,
    i: f64,
    t: f64,
    soc: f64,
    soh: f64,
    capacity_ah: f64,
    errors: Vec<&'static str>,
    warnings: Vec<&'static str>,
    status: BTreeMap<&'static str, bool>,
    inputs: Vec<InputHealth>,
}

#[derive(Serialize)]
struct InputHealth {
    desc: String,
    fresh: bool,
    last_seen_age_s: f64,
}

impl Telemetry {
    fn build(state: &UnifiedState, inputs: &[watch::Receiver<BmsSnapshot>]) -> Self {
        let now = Instant::now();
        let inputs = inputs
            .iter()
            .map(|rx| {
                let snapshot = rx.borrow();
                InputHealth {
                    desc: snapshot.desc.clone(),
                    fresh: snapshot.is_fresh(now),
                    last_seen_age_s: snapshot.last_seen_age(now).as_secs_f64(),
                }
            })
            .collect();

        Self {
            gen: state.generation,
            ts: epoch_seconds(),
            u_charge: state.u_setpoint_charge,
            u_discharge: state.u_setpoint_discharge,
            i_lim_charge: state.i_lim_charge,
            i_lim_discharge: state.i_lim_discharge,
            u: state.u_measured,
            i: state.i_measured,
            t: state.t_measured,
            soc: state.soc,
            soh: state.soh,
            capacity_ah: state.capacity_total_ah,
            errors: state.error_flags.active_names(),
            warnings: state.warning_flags.active_names(),
            status: state.status_flags.named_entries().into_iter().collect(),
            inputs,
        }
    }
}
// }}}

#[derive(Clone)]
pub struct Mqtt {
    config: config::Mqtt,
    channels: Channels,
    inputs: Vec<watch::Receiver<BmsSnapshot>>,
    stats: SharedStats,
}

impl Mqtt {
    pub fn new(
        config: config::Mqtt,
        channels: Channels,
        inputs: Vec<watch::Receiver<BmsSnapshot>>,
        stats: SharedStats,
    ) -> Self {
        Self {
            config,
            channels,
            inputs,
            stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        if !self.config.activated() {
            info!("mqtt deactivated, skipping");
            return Ok(());
        }

        let mut options =
            MqttOptions::new(CLIENT_ID, self.config.broker(), self.config.port());
        options.set_keep_alive(KEEP_ALIVE);
        options.set_last_will(LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        });

        info!(
            "publishing to {} on {}:{}",
            self.config.topic(),
            self.config.broker(),
            self.config.port()
        );

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(self.connection(eventloop), self.publisher(client))?;

        Ok(())
    }

    /// Drives the rumqttc event loop; poll errors mean the broker is gone
    /// and trigger the reconnect backoff.
    async fn connection(&self, mut eventloop: EventLoop) -> Result<()> {
        let mut shutdown = self.channels.shutdown.subscribe();
        let mut backoff = Backoff::new(RECONNECT_START, RECONNECT_CAP);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("mqtt connection stopping");
                    return Ok(());
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        info!("connected to broker {}", self.config.broker());
                        backoff.reset();
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let delay = backoff.next();
                        error!("broker connection lost: {err}, retrying in {delay:?}");
                        if let Ok(mut stats) = self.stats.lock() {
                            stats.mqtt_errors += 1;
                        }
                        tokio::select! {
                            _ = shutdown.recv() => return Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    /// Publishes at most one telemetry message per interval, and only when
    /// the aggregator has produced a new generation since the last one.
    /// Skipped ticks are not queued.
    async fn publisher(&self, client: AsyncClient) -> Result<()> {
        let mut shutdown = self.channels.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let _ = client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await;

        let mut last_published: Option<u64> = None;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("mqtt publisher stopping");
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let state = self.channels.unified.borrow().clone();
                    let Some(state) = state else { continue };
                    // Stale inputs stop the aggregator, the generation
                    // freezes and publishing goes quiet with it.
                    if last_published == Some(state.generation) {
                        debug!("no new unified state, skipping telemetry tick");
                        continue;
                    }

                    let telemetry = Telemetry::build(&state, &self.inputs);
                    let payload = serde_json::to_string(&telemetry)?;
                    match client
                        .publish(self.config.topic(), QoS::AtMostOnce, false, payload)
                        .await
                    {
                        Ok(()) => {
                            last_published = Some(state.generation);
                            if let Ok(mut stats) = self.stats.lock() {
                                stats.mqtt_published += 1;
                            }
                        }
                        Err(err) => {
                            error!("telemetry publish failed: {err}");
                            if let Ok(mut stats) = self.stats.lock() {
                                stats.mqtt_errors += 1;
                            }
                        }
                    }
                }
            }
        }
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.topic())
    }
}
