//! Single consumer applying session messages to the aggregator.

use crate::core::aggregator::{AggregatorMessage, SharedAggregator};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Drains [`AggregatorMessage`]s in arrival order.
pub struct MergeWorker {
    aggregator: SharedAggregator,
    rx: UnboundedReceiver<AggregatorMessage>,
}

impl MergeWorker {
    pub fn new(aggregator: SharedAggregator) -> (Self, UnboundedSender<AggregatorMessage>) {
        let (tx, rx) = unbounded_channel();
        (Self { aggregator, rx }, tx)
    }

    /// Spawn the worker on the current runtime. It exits once every sender
    /// is dropped.
    pub fn spawn(
        aggregator: SharedAggregator,
    ) -> (UnboundedSender<AggregatorMessage>, JoinHandle<()>) {
        let (worker, tx) = Self::new(aggregator);
        (tx, tokio::spawn(worker.run()))
    }

    pub async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            self.aggregator.apply(message);
        }
        tracing::debug!("merge worker stopped");
    }
}
