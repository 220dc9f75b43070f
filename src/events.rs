use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::models::dto::{AnomalyEvent, StatsEvent};

/// Everything the sensor reports to its host.
///
/// Serializes as `{"message_type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "payload")]
pub enum SensorEvent {
    Stats(StatsEvent),
    Anomaly(AnomalyEvent),
    CaptureError {
        timestamp: DateTime<Utc>,
        message: String,
    },
    ReplayComplete {
        timestamp: DateTime<Utc>,
    },
}

impl SensorEvent {
    pub fn capture_error(message: impl Into<String>) -> Self {
        SensorEvent::CaptureError {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }

    pub fn replay_complete() -> Self {
        SensorEvent::ReplayComplete {
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out of [`SensorEvent`]s to any number of subscribers.
///
/// Publishing never blocks: each subscriber has its own bounded buffer, a
/// full buffer drops the event for that subscriber only and a dropped
/// receiver is forgotten on the next publish.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<SensorEvent>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        EventBus {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Receiver<SensorEvent> {
        let (tx, rx) = bounded(self.capacity);
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: SensorEvent) {
        self.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("subscriber lagging, event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<SensorEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(1024)
    }
}
