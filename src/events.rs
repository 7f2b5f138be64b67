//! Outbound events pushed to orchestrator subscribers.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::indicators::Indicator;
use crate::task::ProgressAggregate;

/// Every event the orchestrator emits. Delivered in emission order to each
/// subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OcrEvent {
    /// A task's progress moved (0-100).
    Progress {
        file_id: String,
        backend_id: String,
        percent: u8,
    },
    /// A task completed; its indicators are now cached.
    Result {
        file_id: String,
        backend_id: String,
        indicators: Vec<Indicator>,
    },
    /// A task failed, or (with no backend) the attachment could not be read.
    Error {
        file_id: String,
        backend_id: Option<String>,
        message: String,
        retryable: bool,
    },
    /// A task was cancelled before producing a result.
    Cancelled { file_id: String, backend_id: String },
    /// A pair was not admitted because it is cached or already in flight.
    Skipped { file_id: String, backend_id: String },
    /// Progress of one batch, pushed after each change to one of its tasks.
    Aggregate {
        batch_id: String,
        #[serde(flatten)]
        progress: ProgressAggregate,
    },
    /// Every task admitted for the batch is terminal.
    BatchComplete { batch_id: String },
}

/// Observer list of unbounded channels. Closed receivers are pruned on the
/// next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<OcrEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OcrEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: OcrEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(OcrEvent::BatchComplete { batch_id: "b1".into() });
        bus.publish(OcrEvent::BatchComplete { batch_id: "b2".into() });

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap(), OcrEvent::BatchComplete { batch_id: "b1".into() });
            assert_eq!(rx.try_recv().unwrap(), OcrEvent::BatchComplete { batch_id: "b2".into() });
        }
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _keep = bus.subscribe();
        drop(rx);

        bus.publish(OcrEvent::BatchComplete { batch_id: "b".into() });
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_serialized_shape() {
        let event = OcrEvent::Progress {
            file_id: "a.png".into(),
            backend_id: "fast".into(),
            percent: 50,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["percent"], 50);
    }
}
