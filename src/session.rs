//! One-stop wiring for a dashboard session.
//!
//! The UI used to let every page open its own broker connection; this
//! context is the replacement. Build it once at startup, hand clones of the
//! handles to whoever needs them and tear the whole thing down once.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::{CommandPublisher, ConnectionManager, TopicRouter};
use crate::config::{topics, Config};
use crate::cycle::CycleHandle;
use crate::imaging::ImageStreamClient;

const INBOUND_BUFFER: usize = 256;

/// A fully wired session: one broker connection, one router, one command
/// path, one cycle worker and one image stream.
pub struct SessionContext {
    pub config: Config,
    pub connection: Arc<ConnectionManager>,
    pub router: TopicRouter,
    pub commands: Arc<CommandPublisher>,
    pub cycle: CycleHandle,
    pub images: ImageStreamClient,
}

impl SessionContext {
    /// Wire everything up and start connecting to the broker.
    ///
    /// Broker connection failures are reported through the session event
    /// stream and retried by the driver. The image stream is not opened
    /// here; call `images.connect()` when the imaging view comes up.
    pub async fn start(config: Config) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let connection = Arc::new(ConnectionManager::new(config.broker.clone(), inbound_tx));
        let router = TopicRouter::spawn(connection.clone(), inbound_rx);
        for topic in &config.broker.subscriptions {
            router.subscribe(topic).await;
        }

        let commands = Arc::new(CommandPublisher::new(
            config.broker.command_topics.clone(),
            connection.clone(),
        ));
        let weight_feed = router.listen(topics::WEIGHT).await;
        let cycle = CycleHandle::spawn(weight_feed, commands.clone());

        let images = ImageStreamClient::new(config.image_stream.clone());

        connection.connect();

        Self {
            config,
            connection,
            router,
            commands,
            cycle,
            images,
        }
    }

    /// Stop every task and close the broker connection. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        self.cycle.shutdown();
        self.images.shutdown();
        self.router.shutdown();
        self.connection.disconnect().await;
    }
}
