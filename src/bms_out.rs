//! Output session: one emulated BMS facing one battery inverter.
//!
//! Applies the per-inverter current transform and emits the six-telegram
//! set, either pushed on every unified-state update or as a reply to the
//! inverter's sync telegram.

use std::time::Duration;

use socketcan::tokio::CanSocket;

use crate::prelude::*;
use crate::pylontech::telegram::{
    self, Alarms, ChargeParams, Manufacturer, Measurements, SocSoh, Status, Telegram,
};
use crate::utils::{standard_frame_parts, to_can_frame};

const RECONNECT_START: Duration = Duration::from_millis(250);
const RECONNECT_CAP: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct BmsOut {
    config: config::BmsOut,
    channels: Channels,
    stats: SharedStats,
}

impl BmsOut {
    pub fn new(config: config::BmsOut, channels: Channels, stats: SharedStats) -> Self {
        Self {
            config,
            channels,
            stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut shutdown = self.channels.shutdown.subscribe();
        let mut backoff = Backoff::new(RECONNECT_START, RECONNECT_CAP);

        loop {
            let socket = match CanSocket::open(self.config.can_if()) {
                Ok(socket) => {
                    info!(
                        "{}: emulating BMS on {} ({} mode)",
                        self.config.description(),
                        self.config.can_if(),
                        if self.config.send_sync_activated() {
                            "sync"
                        } else {
                            "push"
                        }
                    );
                    socket
                }
                Err(err) => {
                    error!(
                        "{}: cannot open {}: {}",
                        self.config.description(),
                        self.config.can_if(),
                        err
                    );
                    if !self.pause(backoff.next(), &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            backoff.reset();

            let result = if self.config.send_sync_activated() {
                self.run_sync(&socket, &mut shutdown).await
            } else {
                self.run_push(&socket, &mut shutdown).await
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    error!("{}: {:#}", self.config.description(), err);
                    if !self.pause(backoff.next(), &mut shutdown).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Push mode: forward every unified-state update, rate limited by the
    /// configured minimum delay. The watch slot drops intermediates, so the
    /// newest generation always wins.
    async fn run_push(
        &self,
        socket: &CanSocket,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut unified = self.channels.unified.clone();

        // The aggregator may have produced a state before this session
        // came up; start from it.
        let current = unified.borrow_and_update().clone();
        if let Some(state) = current {
            self.transmit(socket, &state).await;
            if !self.rate_limit(shutdown).await {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("{}: stopping", self.config.description());
                    return Ok(());
                }
                changed = unified.changed() => {
                    if changed.is_err() {
                        // Aggregator gone; supervisor restarts it.
                        bail!("unified state channel closed");
                    }
                    let state = unified.borrow_and_update().clone();
                    if let Some(state) = state {
                        self.transmit(socket, &state).await;
                        if !self.rate_limit(shutdown).await {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Sync mode: answer each inverter sync telegram with the current set,
    /// and emit our own sync telegram periodically to retrigger the cycle.
    async fn run_sync(
        &self,
        socket: &CanSocket,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.sync_interval());

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("{}: stopping", self.config.description());
                    return Ok(());
                }
                frame = socket.read_frame() => {
                    let frame = frame
                        .with_context(|| format!("read on {}", self.config.can_if()))?;
                    let Some((id, data)) = standard_frame_parts(&frame) else {
                        continue;
                    };
                    if !matches!(
                        telegram::decode(id, data),
                        Ok(telegram::FrameKind::Telegram(Telegram::InverterSync(_)))
                    ) {
                        continue;
                    }
                    let state = self.channels.unified.borrow().clone();
                    match state {
                        Some(state) => self.transmit(socket, &state).await,
                        // Nothing aggregated yet; stay quiet instead of
                        // reporting zero current limits.
                        None => debug!(
                            "{}: sync request before first unified state",
                            self.config.description()
                        ),
                    }
                }
                _ = ticker.tick() => {
                    self.send_frame(socket, &Telegram::from(telegram::InverterSync)).await;
                }
            }
        }
    }

    async fn transmit(&self, socket: &CanSocket, state: &UnifiedState) {
        for telegram in telegram_set(&self.config, state) {
            self.send_frame(socket, &telegram).await;
        }
    }

    // A failed send is counted and the rest of the set still goes out.
    async fn send_frame(&self, socket: &CanSocket, telegram: &Telegram) {
        let frame = match to_can_frame(telegram) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("{}: {:#}", self.config.description(), err);
                return;
            }
        };
        match socket.write_frame(frame).await {
            Ok(()) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.frames_sent += 1;
                }
            }
            Err(err) => {
                warn!("{}: send failed: {}", self.config.description(), err);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.send_errors += 1;
                }
            }
        }
    }

    /// Enforce the minimum delay between push emissions; false means
    /// shutdown arrived during the wait.
    async fn rate_limit(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let delay = self.config.push_min_delay();
        if delay.is_zero() {
            return true;
        }
        self.pause(delay, shutdown).await
    }

    async fn pause(
        &self,
        delay: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        tokio::select! {
            _ = shutdown.recv() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// The outbound telegram set for one inverter, in the order real devices
/// emit it.
pub fn telegram_set(config: &config::BmsOut, state: &UnifiedState) -> Vec<Telegram> {
    // Inverter limits cap the pack limits, never raise them.
    let i_lim_charge = state.i_lim_charge.min(config.i_lim_charge());
    let i_lim_discharge = state.i_lim_discharge.min(config.i_lim_discharge());
    // This inverter's share of the total current.
    let i = state.i_measured * config.i_scaling() + config.i_offset();

    vec![
        ChargeParams {
            u_charge: state.u_setpoint_charge,
            i_lim_charge,
            i_lim_discharge,
            u_discharge: state.u_setpoint_discharge,
        }
        .into(),
        SocSoh::new(state.soc, state.soh).into(),
        Measurements {
            u: state.u_measured,
            i,
            t: state.t_measured,
        }
        .into(),
        Alarms {
            errors: state.error_flags,
            warnings: state.warning_flags,
            n_modules: u8::try_from(state.n_modules).unwrap_or(u8::MAX),
        }
        .into(),
        Status {
            flags: state.status_flags,
        }
        .into(),
        Manufacturer::new(&state.manufacturer).into(),
    ]
}
