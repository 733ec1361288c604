//! Outbound trigger bus.

use crate::core::TriggerEvent;
use crate::errors::StagegateError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Delivers triggers to the next stage's executor.
#[async_trait]
pub trait TriggerBus: Send + Sync {
    /// Publishes a trigger. An error means it was not delivered.
    async fn publish(&self, trigger: TriggerEvent) -> Result<(), StagegateError>;
}

/// A trigger bus backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelTriggerBus {
    tx: mpsc::Sender<TriggerEvent>,
}

impl ChannelTriggerBus {
    /// Creates a bus and the receiver its triggers arrive on.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TriggerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TriggerBus for ChannelTriggerBus {
    async fn publish(&self, trigger: TriggerEvent) -> Result<(), StagegateError> {
        self.tx
            .send(trigger)
            .await
            .map_err(|err| StagegateError::TransientInfra(format!("trigger bus closed: {err}")))
    }
}
