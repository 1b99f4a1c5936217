//! Broker connection lifecycle.
//!
//! One `ConnectionManager` instance owns the single MQTT-over-WebSocket
//! connection for the whole process. It drives the rumqttc event loop on a
//! background task, publishes every state transition on a watch channel and
//! every noteworthy incident on a broadcast channel. Callers never see a
//! transport error as a `Result`; failures are observable state, and a
//! failed publish degrades to a logged warning so the operator can retry.

use std::sync::Mutex;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const REQUEST_CHANNEL_CAPACITY: usize = 100;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

/// Reason code attached to connection error events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    AuthFailure,
    NetworkUnreachable,
    ProtocolError,
    Timeout,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DisconnectReason::AuthFailure => "auth_failure",
            DisconnectReason::NetworkUnreachable => "network_unreachable",
            DisconnectReason::ProtocolError => "protocol_error",
            DisconnectReason::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

/// Incidents surfaced to the UI and other passive observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    ConnectionError(DisconnectReason),
    /// A publish was dropped because the session was not connected.
    PublishDropped { topic: String },
    /// A command was refused by the allow-list.
    CommandRejected { topic: String },
}

/// Raw inbound publish handed to the router.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct ConnectionManager {
    config: BrokerConfig,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    client: Mutex<Option<AsyncClient>>,
    driver_cancel: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    pub fn new(config: BrokerConfig, inbound_tx: mpsc::Sender<InboundMessage>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            state_tx,
            events_tx,
            inbound_tx,
            client: Mutex::new(None),
            driver_cancel: Mutex::new(None),
        }
    }

    /// Current connection state; never blocks.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to session incidents (errors, dropped publishes).
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Establish the broker connection. No-op while a connection attempt is
    /// already underway or live; failures surface as events, never panics.
    pub fn connect(&self) {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("connect() ignored, session already {:?}", self.state());
                return;
            }
            _ => {}
        }

        let mut options =
            MqttOptions::new(self.config.client_id.clone(), self.config.url(), self.config.port);
        options
            .set_transport(Transport::wss_with_default_config())
            .set_credentials(self.config.username.clone(), self.config.password.clone())
            .set_keep_alive(self.config.keep_alive());

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        *self.client.lock().expect("client lock") = Some(client);

        let cancel = CancellationToken::new();
        {
            let mut slot = self.driver_cancel.lock().expect("cancel lock");
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
            *slot = Some(cancel.clone());
        }

        self.set_state(ConnectionState::Connecting);
        info!("Connecting to broker at {}", self.config.url());

        let driver = Driver {
            config: self.config.clone(),
            state_tx: self.state_tx.clone(),
            events_tx: self.events_tx.clone(),
            inbound_tx: self.inbound_tx.clone(),
            cancel,
        };
        tokio::spawn(driver.run(event_loop));
    }

    /// Tear the connection down and release the driver task and any pending
    /// reconnect timer. Safe to call repeatedly and before `connect()`.
    pub async fn disconnect(&self) {
        let cancel = self.driver_cancel.lock().expect("cancel lock").take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let client = self.client.lock().expect("client lock").take();
        if let Some(client) = client {
            // Best effort DISCONNECT; the transport may already be gone.
            if let Err(e) = client.disconnect().await {
                debug!("DISCONNECT not sent: {}", e);
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Fire-and-forget publish. When the session is not connected this is a
    /// logged warning plus an observable event, not an error; the operator
    /// retries manually.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) {
        if self.state() != ConnectionState::Connected {
            warn!("Not connected, dropping publish to {}", topic);
            let _ = self.events_tx.send(SessionEvent::PublishDropped {
                topic: topic.to_string(),
            });
            return;
        }
        let client = self.client.lock().expect("client lock").clone();
        let Some(client) = client else {
            warn!("No client, dropping publish to {}", topic);
            let _ = self.events_tx.send(SessionEvent::PublishDropped {
                topic: topic.to_string(),
            });
            return;
        };
        if let Err(e) = client.publish(topic, qos, retain, payload.into()).await {
            warn!("Publish to {} failed: {}", topic, e);
            let _ = self.events_tx.send(SessionEvent::PublishDropped {
                topic: topic.to_string(),
            });
        }
    }

    /// Register a topic with the broker. The router queues topics until the
    /// session is connected, so this only logs when called too early.
    pub async fn subscribe_topic(&self, topic: &str) {
        let client = self.client.lock().expect("client lock").clone();
        let Some(client) = client else {
            debug!("Subscribe to {} deferred, no client yet", topic);
            return;
        };
        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
            warn!("Subscribe to {} failed: {}", topic, e);
        }
    }

    /// Surface an allow-list rejection on the shared event feed.
    pub(crate) fn note_rejected_command(&self, topic: &str) {
        let _ = self.events_tx.send(SessionEvent::CommandRejected {
            topic: topic.to_string(),
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        let _ = self.events_tx.send(SessionEvent::StateChanged(state));
    }
}

/// Background task that owns the rumqttc event loop for one connection.
struct Driver {
    config: BrokerConfig,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self, mut event_loop: EventLoop) {
        let mut backoff = Duration::from_millis(self.config.reconnect_base_ms);
        let cap = Duration::from_millis(self.config.reconnect_cap_ms);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Broker driver cancelled");
                    self.set_state(ConnectionState::Disconnected);
                    break;
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Broker session established");
                        backoff = Duration::from_millis(self.config.reconnect_base_ms);
                        self.set_state(ConnectionState::Connected);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if self.inbound_tx.send(message).await.is_err() {
                            // Router gone; the session is shutting down.
                            self.set_state(ConnectionState::Disconnected);
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let reason = classify(&e);
                        warn!("Broker connection lost ({}): {}", reason, e);
                        self.set_state(ConnectionState::Errored);
                        let _ = self.events_tx.send(SessionEvent::ConnectionError(reason));

                        if !self.config.auto_reconnect {
                            self.set_state(ConnectionState::Disconnected);
                            break;
                        }

                        self.set_state(ConnectionState::Disconnected);
                        info!("Reconnecting in {:?}", backoff);
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                debug!("Reconnect timer cancelled");
                                break;
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(cap);
                        self.set_state(ConnectionState::Connecting);
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        let _ = self.events_tx.send(SessionEvent::StateChanged(state));
    }
}

fn classify(err: &ConnectionError) -> DisconnectReason {
    match err {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                DisconnectReason::AuthFailure
            }
            ConnectReturnCode::ServiceUnavailable => DisconnectReason::NetworkUnreachable,
            _ => DisconnectReason::ProtocolError,
        },
        ConnectionError::Io(_) => DisconnectReason::NetworkUnreachable,
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            DisconnectReason::Timeout
        }
        _ => DisconnectReason::ProtocolError,
    }
}
