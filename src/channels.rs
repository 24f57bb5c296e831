use crate::prelude::*;

/// Clonable channel endpoints wiring the gateway together.
///
/// Input sessions notify the aggregator through `snapshot_changed`; the
/// mailbox is bounded at the input count and `try_send` drops on overflow,
/// which only coalesces notifications since the aggregator always reads the
/// latest snapshots. The unified state travels through a single-slot watch:
/// subscribers see the latest value and deliberately miss intermediates.
#[derive(Clone)]
pub struct Channels {
    pub shutdown: broadcast::Sender<()>,
    pub snapshot_changed: mpsc::Sender<usize>,
    pub unified: watch::Receiver<Option<UnifiedState>>,
}

/// Receiving ends owned by the aggregator task.
pub struct AggregatorLink {
    pub mailbox: mpsc::Receiver<usize>,
    pub unified_tx: watch::Sender<Option<UnifiedState>>,
}

impl Channels {
    pub fn new(n_inputs: usize) -> (Self, AggregatorLink) {
        let (shutdown, _) = broadcast::channel(1);
        let (snapshot_changed, mailbox) = mpsc::channel(n_inputs.max(1));
        let (unified_tx, unified) = watch::channel(None);

        (
            Self {
                shutdown,
                snapshot_changed,
                unified,
            },
            AggregatorLink {
                mailbox,
                unified_tx,
            },
        )
    }
}
