//! Message bus: MQTT transport plus routing of inbound topics.

pub mod dispatch;
pub mod mqtt;
pub mod topic;

pub use dispatch::{DeviceAction, Dispatcher, Route};
pub use mqtt::BusError;
pub use topic::format_topic;

/// An outbound message for the publisher task
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
}

impl Publication {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}
