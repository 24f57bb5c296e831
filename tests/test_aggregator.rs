mod common;

use std::time::{Duration, Instant};

use common::Factory;

use bms_gateway::aggregator::{all_fresh, reduce, Aggregator};
use bms_gateway::prelude::*;

#[test]
fn two_inputs_weighted_average() {
    let now = Instant::now();
    let mut a = Factory::snapshot("a", 100.0, Duration::from_secs(3));
    let mut b = Factory::snapshot("b", 300.0, Duration::from_secs(3));
    Factory::feed(&mut a, 40, 51.0, 5.0, 55.0, 100.0, now);
    Factory::feed(&mut b, 80, 53.0, 15.0, 56.0, 100.0, now);

    let state = reduce(&[a, b], &Factory::battery(), 1);
    // (40*100 + 80*300) / 400
    assert_eq!(state.soc, 70.0);
    // lowest charge voltage request wins
    assert_eq!(state.u_setpoint_charge, 55.0);
    // currents sum
    assert_eq!(state.i_measured, 20.0);
    assert_eq!(state.capacity_total_ah, 400.0);
}

#[test]
fn current_limit_clamps_to_pack_limit() {
    let now = Instant::now();
    let mut a = Factory::snapshot("a", 100.0, Duration::from_secs(3));
    let mut b = Factory::snapshot("b", 100.0, Duration::from_secs(3));
    Factory::feed(&mut a, 50, 52.0, 0.0, 55.0, 400.0, now);
    Factory::feed(&mut b, 50, 52.0, 0.0, 55.0, 400.0, now);

    let state = reduce(&[a, b], &Factory::battery(), 1);
    // 800 summed, pack limit 700
    assert_eq!(state.i_lim_charge, 700.0);
}

/// The full mailbox-to-watch path: updates produce unified states while
/// all inputs are fresh, a quiet input freezes the output, and recovery
/// resumes it.
#[tokio::test]
async fn staleness_gates_unified_output() {
    let window = Duration::from_millis(100);
    let (a_tx, a_rx) = watch::channel(Factory::snapshot("a", 100.0, window));
    let (b_tx, b_rx) = watch::channel(Factory::snapshot("b", 100.0, window));

    let (channels, link) = Channels::new(2);
    let aggregator = Aggregator::new(
        Factory::battery(),
        vec![a_rx, b_rx],
        link,
        channels.clone(),
        GatewayStats::shared(),
    );
    let mut unified = channels.unified.clone();

    let handle = {
        let aggregator = aggregator.clone();
        tokio::spawn(async move { aggregator.start().await })
    };

    let feed = |tx: &watch::Sender<BmsSnapshot>, soc: u16| {
        tx.send_modify(|s| Factory::feed(s, soc, 52.0, 10.0, 55.0, 100.0, Instant::now()));
    };

    // Both inputs report: a unified state appears.
    feed(&a_tx, 40);
    feed(&b_tx, 80);
    channels.snapshot_changed.send(0).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), unified.changed())
        .await
        .expect("no unified state produced")
        .unwrap();
    let first = unified.borrow_and_update().clone().unwrap();
    assert_eq!(first.soc, 60.0);

    // b goes quiet past the freshness window; updates from a alone must
    // not produce a new generation.
    tokio::time::sleep(window * 2).await;
    feed(&a_tx, 42);
    channels.snapshot_changed.send(0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!unified.has_changed().unwrap());

    // b resumes: aggregation picks up again with a fresh generation.
    feed(&a_tx, 42);
    feed(&b_tx, 80);
    channels.snapshot_changed.send(1).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), unified.changed())
        .await
        .expect("aggregation did not resume")
        .unwrap();
    let second = unified.borrow_and_update().clone().unwrap();
    assert!(second.generation > first.generation);
    assert_eq!(second.soc, 61.0);

    // Shutdown ends the task cleanly.
    channels.shutdown.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("aggregator ignored shutdown")
        .unwrap();
    assert!(result.is_ok());
    drop((a_tx, b_tx, aggregator));
}

#[tokio::test]
async fn repeated_aggregation_is_stable_modulo_generation() {
    let now = Instant::now();
    let mut a = Factory::snapshot("a", 100.0, Duration::from_secs(3));
    let mut b = Factory::snapshot("b", 250.0, Duration::from_secs(3));
    Factory::feed(&mut a, 40, 51.0, 5.0, 55.0, 100.0, now);
    Factory::feed(&mut b, 80, 53.0, 15.0, 56.0, 100.0, now);
    assert!(all_fresh(&[a.clone(), b.clone()], now));

    let battery = Factory::battery();
    let mut first = reduce(&[a.clone(), b.clone()], &battery, 1);
    let second = reduce(&[a, b], &battery, 2);
    assert_ne!(first.generation, second.generation);
    first.generation = second.generation;
    assert_eq!(first, second);
}

/// Mailbox overflow only coalesces: one recomputation still happens.
#[tokio::test]
async fn mailbox_overflow_coalesces() {
    let window = Duration::from_secs(3);
    let (a_tx, a_rx) = watch::channel(Factory::snapshot("a", 100.0, window));

    let (channels, link) = Channels::new(1);
    let aggregator = Aggregator::new(
        Factory::battery(),
        vec![a_rx],
        link,
        channels.clone(),
        GatewayStats::shared(),
    );
    let mut unified = channels.unified.clone();

    a_tx.send_modify(|s| Factory::feed(s, 50, 52.0, 10.0, 55.0, 100.0, Instant::now()));
    // More notifications than the mailbox holds, before the task runs.
    for _ in 0..5 {
        let _ = channels.snapshot_changed.try_send(0);
    }

    let handle = tokio::spawn(async move { aggregator.start().await });
    tokio::time::timeout(Duration::from_secs(1), unified.changed())
        .await
        .expect("no unified state produced")
        .unwrap();
    assert!(unified.borrow_and_update().is_some());

    channels.shutdown.send(()).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    drop(a_tx);
}
