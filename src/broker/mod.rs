//! # Broker session
//!
//! Everything that touches the MQTT-over-WebSocket broker lives here:
//!
//! ```text
//! broker/
//! ├── connection.rs - single shared connection, state machine, reconnect
//! ├── router.rs     - subscription set, latest-value cache, fan-out
//! └── command.rs    - allow-listed outbound command path
//! ```
//!
//! The split mirrors how the rest of the crate consumes the broker: the
//! connection manager owns the transport and is the only writer of
//! connection state; the router is the only writer of the message cache;
//! the command publisher is a thin validated facade over publish. The
//! dashboard's earlier habit of opening one connection per page is exactly
//! what this module replaces: there is one `ConnectionManager` per
//! process, injected into every consumer.

pub mod command;
pub mod connection;
pub mod router;

pub use command::{CommandError, CommandPublisher};
pub use connection::{
    ConnectionManager, ConnectionState, DisconnectReason, InboundMessage, SessionEvent,
};
pub use router::{Payload, TopicMessage, TopicRouter};
