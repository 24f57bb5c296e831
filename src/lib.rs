pub mod aggregator;
pub mod bms_in;
pub mod bms_out;
pub mod channels;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod pylontech;
pub mod state;
pub mod stats;
pub mod utils;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::aggregator::Aggregator;
use crate::bms_in::BmsIn;
use crate::bms_out::BmsOut;
use crate::mqtt::Mqtt;
use crate::options::Options;
use crate::prelude::*;

const MAX_TASK_FAILURES: u32 = 10;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const RESTART_DELAY: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub async fn app(options: Options) -> Result<()> {
    if options.init {
        let path = config::default_config_path()?;
        return config::init_config(&path);
    }

    let path = match &options.config_file {
        Some(path) => PathBuf::from(path),
        None => config::default_config_path()?,
    };
    let config = Config::load(&path)?;

    if !config.gateway_activated() {
        info!(
            "gateway not activated, edit {} and set GATEWAY-ACTIVATED",
            path.display()
        );
        return Ok(());
    }

    info!(
        "starting bms-gateway {} with {} inputs and {} outputs",
        CARGO_PKG_VERSION,
        config.bmses_in().len(),
        config.bmses_out().len()
    );

    let stats = GatewayStats::shared();
    let (channels, link) = Channels::new(config.bmses_in().len());

    // Per-input snapshot slots; the sessions write, everybody else reads.
    let mut snapshot_rxs = Vec::new();
    let mut inputs = Vec::new();
    for (index, bms) in config.bmses_in().iter().enumerate() {
        let (tx, rx) = watch::channel(BmsSnapshot::new(
            bms.description(),
            bms.capacity_ah(),
            bms.freshness_window(),
        ));
        snapshot_rxs.push(rx);
        inputs.push(BmsIn::new(
            index,
            bms.clone(),
            channels.clone(),
            Arc::new(tx),
            stats.clone(),
        ));
    }

    let aggregator = Aggregator::new(
        config.battery().clone(),
        snapshot_rxs.clone(),
        link,
        channels.clone(),
        stats.clone(),
    );
    let outputs: Vec<BmsOut> = config
        .bmses_out()
        .iter()
        .map(|bms| BmsOut::new(bms.clone(), channels.clone(), stats.clone()))
        .collect();
    let mqtt = Mqtt::new(
        config.mqtt().clone(),
        channels.clone(),
        snapshot_rxs,
        stats.clone(),
    );

    // Shutdown on SIGINT or SIGTERM.
    {
        let shutdown = channels.shutdown.clone();
        tokio::spawn(async move {
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    Err(err) => error!("cannot listen for SIGTERM: {err}"),
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate => {}
            }
            info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let mut handles = Vec::new();
    handles.push(supervise("aggregator".to_string(), channels.clone(), {
        let aggregator = aggregator.clone();
        move || {
            let aggregator = aggregator.clone();
            async move { aggregator.start().await }
        }
    }));
    for (bms, conf) in inputs.into_iter().zip(config.bmses_in()) {
        handles.push(supervise(
            format!("bms-in {}", conf.can_if()),
            channels.clone(),
            move || {
                let bms = bms.clone();
                async move { bms.start().await }
            },
        ));
    }
    for (bms, conf) in outputs.into_iter().zip(config.bmses_out()) {
        handles.push(supervise(
            format!("bms-out {}", conf.can_if()),
            channels.clone(),
            move || {
                let bms = bms.clone();
                async move { bms.start().await }
            },
        ));
    }
    handles.push(supervise("mqtt".to_string(), channels.clone(), {
        let mqtt = mqtt.clone();
        move || {
            let mqtt = mqtt.clone();
            async move { mqtt.start().await }
        }
    }));

    // Tasks end on shutdown (Ok) or when their restart budget is spent
    // (Err, after broadcasting shutdown themselves). Allow a grace period
    // for everybody to wind down once the signal is out.
    let mut shutdown_rx = channels.shutdown.subscribe();
    let all = futures::future::join_all(handles);
    tokio::pin!(all);

    let results = tokio::select! {
        results = &mut all => results,
        _ = shutdown_rx.recv() => {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut all).await {
                Ok(results) => results,
                Err(_) => {
                    warn!("tasks still running after {SHUTDOWN_GRACE:?}, exiting anyway");
                    Vec::new()
                }
            }
        }
    };

    if let Ok(stats) = stats.lock() {
        stats.print_summary();
    }

    for result in results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(join_err) => {
                return Err(FatalError::new(format!("supervisor died: {join_err}")).into())
            }
        }
    }
    info!("shutdown complete");

    Ok(())
}

/// Run a component under restart supervision. A graceful end (component
/// returned Ok) finishes the handle; failures and panics restart it after
/// a delay. Spending the whole failure budget inside one window broadcasts
/// shutdown and surfaces a fatal error.
fn supervise<F, Fut>(name: String, channels: Channels, mut task: F) -> JoinHandle<Result<()>>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        let mut window_start = std::time::Instant::now();

        loop {
            match tokio::spawn(task()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => error!("task {name} failed: {err:#}"),
                Err(join_err) if join_err.is_panic() => {
                    error!("task {name} panicked");
                }
                // Cancelled, runtime is going away.
                Err(_) => return Ok(()),
            }

            if window_start.elapsed() > FAILURE_WINDOW {
                failures = 0;
                window_start = std::time::Instant::now();
            }
            failures += 1;
            if failures >= MAX_TASK_FAILURES {
                error!("task {name} failed {failures} times within {FAILURE_WINDOW:?}, giving up");
                let _ = channels.shutdown.send(());
                return Err(
                    FatalError::new(format!("task {name} exceeded its restart budget")).into(),
                );
            }

            let mut shutdown = channels.shutdown.subscribe();
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
    })
}
