//! Input session: one battery-side BMS on one CAN interface.
//!
//! Reassembles the telegram group into the snapshot owned by this session
//! and notifies the aggregator whenever a complete snapshot changes.
//! Optionally polls BMSes that only answer to inverter sync telegrams.

use std::time::{Duration, Instant};

use socketcan::tokio::CanSocket;
use socketcan::CanFrame;

use crate::prelude::*;
use crate::pylontech::telegram::{self, FrameKind, Telegram};
use crate::utils::{standard_frame_parts, to_can_frame};

const RECONNECT_START: Duration = Duration::from_millis(250);
const RECONNECT_CAP: Duration = Duration::from_secs(5);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct BmsIn {
    index: usize,
    config: config::BmsIn,
    channels: Channels,
    snapshot: Arc<watch::Sender<BmsSnapshot>>,
    stats: SharedStats,
}

impl BmsIn {
    pub fn new(
        index: usize,
        config: config::BmsIn,
        channels: Channels,
        snapshot: Arc<watch::Sender<BmsSnapshot>>,
        stats: SharedStats,
    ) -> Self {
        Self {
            index,
            config,
            channels,
            snapshot,
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
                        "{}: listening on {}",
                        self.config.description(),
                        self.config.can_if()
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

            match self.run(&socket, &mut shutdown, &mut backoff).await {
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

    /// Sleep between retries; false means shutdown arrived instead.
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

    async fn run(
        &self,
        socket: &CanSocket,
        shutdown: &mut broadcast::Receiver<()>,
        backoff: &mut Backoff,
    ) -> Result<()> {
        let poll_interval = self.config.poll_interval();
        let mut poll =
            tokio::time::interval(poll_interval.unwrap_or(Duration::from_secs(3600)));
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("{}: stopping", self.config.description());
                    return Ok(());
                }
                frame = socket.read_frame() => {
                    let frame = frame
                        .with_context(|| format!("read on {}", self.config.can_if()))?;
                    backoff.reset();
                    self.handle_frame(&frame);
                }
                _ = poll.tick(), if poll_interval.is_some() => {
                    self.send_poll(socket).await;
                }
                _ = housekeeping.tick() => {
                    self.update_staleness();
                }
            }
        }
    }

    fn handle_frame(&self, frame: &CanFrame) {
        let Some((id, data)) = standard_frame_parts(frame) else {
            return;
        };
        if let Ok(mut stats) = self.stats.lock() {
            stats.frames_received += 1;
        }

        let now = Instant::now();
        match telegram::decode(id, data) {
            Ok(FrameKind::Ignored) => {}
            Ok(FrameKind::Telegram(Telegram::InverterSync(sync))) => {
                // Another inverter (or our own poll) on this bus; only the
                // timestamp is of interest.
                self.snapshot.send_modify(|s| s.apply(&sync.into(), now));
            }
            Ok(FrameKind::Telegram(telegram)) => {
                let mut complete = false;
                self.snapshot.send_modify(|s| {
                    s.apply(&telegram, now);
                    complete = s.complete;
                });
                if complete {
                    // A full mailbox just coalesces change notifications.
                    let _ = self.channels.snapshot_changed.try_send(self.index);
                }
            }
            Err(err) => {
                debug!("{}: {}", self.config.description(), err);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.decode_errors += 1;
                }
                self.snapshot.send_modify(|s| s.invalid_frames += 1);
            }
        }
    }

    async fn send_poll(&self, socket: &CanSocket) {
        let frame = match to_can_frame(&Telegram::from(telegram::InverterSync)) {
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
                warn!(
                    "{}: poll send failed: {}",
                    self.config.description(),
                    err
                );
                if let Ok(mut stats) = self.stats.lock() {
                    stats.send_errors += 1;
                }
            }
        }
    }

    fn update_staleness(&self) {
        let now = Instant::now();
        let snapshot = self.snapshot.borrow();
        let fresh = snapshot.is_fresh(now);
        let (complete, stale) = (snapshot.complete, snapshot.stale);
        drop(snapshot);

        if complete && !fresh && !stale {
            warn!(
                "{}: no complete update within {:?}, marking stale",
                self.config.description(),
                self.config.freshness_window()
            );
            self.snapshot.send_modify(|s| s.stale = true);
        } else if fresh && stale {
            info!("{}: fresh again", self.config.description());
            self.snapshot.send_modify(|s| s.stale = false);
            // Wake the aggregator; the last data-frame notification may
            // have fallen into the stale window.
            let _ = self.channels.snapshot_changed.try_send(self.index);
        }
    }
}
