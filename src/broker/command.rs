//! Validated outbound command path.
//!
//! The rig's command surface is fixed at deploy time; an unknown topic
//! string is a caller bug, not a runtime condition to recover from, so it
//! is refused with a warning instead of reaching the transport.

use std::collections::HashSet;
use std::sync::Arc;

use rumqttc::QoS;
use thiserror::Error;
use tracing::{debug, warn};

use super::connection::ConnectionManager;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Topic is not on the configured allow-list.
    #[error("unknown command topic: {0}")]
    UnknownTopic(String),
}

pub struct CommandPublisher {
    allowed: HashSet<String>,
    connection: Arc<ConnectionManager>,
}

impl CommandPublisher {
    pub fn new(allowed: impl IntoIterator<Item = String>, connection: Arc<ConnectionManager>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            connection,
        }
    }

    /// Send a short command payload. Delivery is at-least-once without
    /// retain; "not connected" degrades to a warning inside the
    /// connection manager rather than an error here.
    pub async fn send(&self, topic: &str, message: &str) -> Result<(), CommandError> {
        if !self.allowed.contains(topic) {
            warn!("Refusing command to unknown topic {}", topic);
            self.connection.note_rejected_command(topic);
            return Err(CommandError::UnknownTopic(topic.to_string()));
        }
        debug!("Command {} -> {}", topic, message);
        self.connection
            .publish(topic, message, QoS::AtLeastOnce, false)
            .await;
        Ok(())
    }
}
