//! Outbound events.
//!
//! Two collaborators receive what the orchestrator decides: the trigger bus
//! carries [`TriggerEvent`](crate::core::TriggerEvent)s to the next stage's
//! executor, and an [`EventSink`] receives alerts and other observability
//! events.

mod alert;
mod bus;
mod sink;

pub use alert::{Alert, AlertKind};
pub use bus::{ChannelTriggerBus, TriggerBus};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
