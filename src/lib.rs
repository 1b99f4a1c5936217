//! Session layer for the feeder operator dashboard.
//!
//! Connects a UI to the plant over two transports: MQTT over WebSocket for
//! weights, maintenance status and operator commands, and a plain WebSocket
//! for the camera image feed. The crate keeps one shared broker connection
//! per process and exposes handle types over background tokio tasks:
//!
//! - [`broker::ConnectionManager`] owns the MQTT session and reconnects,
//! - [`broker::TopicRouter`] caches and fans out routed messages,
//! - [`broker::CommandPublisher`] gates outbound commands to known topics,
//! - [`cycle::CycleHandle`] tracks a dispensing run from the weight feed,
//! - [`imaging::ImageStreamClient`] mirrors the newest camera frames.
//!
//! [`session::SessionContext`] wires all of the above from one [`config::Config`].

pub mod broker;
pub mod config;
pub mod cycle;
pub mod imaging;
pub mod session;

pub use broker::{
    CommandError, CommandPublisher, ConnectionManager, ConnectionState, DisconnectReason,
    SessionEvent, TopicMessage, TopicRouter,
};
pub use config::Config;
pub use cycle::{CycleEvent, CycleHandle, RunPhase, RunSnapshot};
pub use imaging::{GallerySnapshot, ImageStreamClient};
pub use session::SessionContext;
