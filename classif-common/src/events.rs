//! Outbound messages for the downstream image handler
//!
//! Messages use a fixed JSON envelope with a `type` discriminator and are
//! fanned out over a tokio broadcast channel. Publishing is optional: with no
//! subscriber attached the message is dropped.

use crate::db::{DefectMap, RegionBox};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Region payload inside a `model_inference` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionPayload {
    pub file_id: i64,
    pub defects: DefectMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionBox>,
}

/// Messages consumed by the image handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageHandlerMessage {
    /// A model finished a region batch for one file set
    ModelInference {
        file_set: i64,
        ml_model: i64,
        file_regions: Vec<RegionPayload>,
    },
}

/// Broadcast bus for outbound messages
#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<ImageHandlerMessage>,
    capacity: usize,
}

impl MessageBus {
    /// Creates a bus buffering up to `capacity` messages per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to all future messages
    pub fn subscribe(&self) -> broadcast::Receiver<ImageHandlerMessage> {
        self.tx.subscribe()
    }

    /// Publish a message
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn publish(
        &self,
        message: ImageHandlerMessage,
    ) -> Result<usize, broadcast::error::SendError<ImageHandlerMessage>> {
        self.tx.send(message)
    }

    /// Publish, ignoring the absence of subscribers
    pub fn publish_lossy(&self, message: ImageHandlerMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("No image handler subscribed, outbound message dropped");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
