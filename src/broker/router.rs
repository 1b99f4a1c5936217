//! Inbound message fan-out.
//!
//! The router owns the subscription set and a per-topic cache of the most
//! recent message. A single task consumes the connection driver's inbound
//! feed, appends to a bounded diagnostic history and notifies listeners in
//! arrival order. The latest-value cache is written only by that task and
//! read freely by any number of consumers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::connection::{ConnectionManager, ConnectionState, InboundMessage};

/// Per-topic diagnostic history depth; the oldest entries roll off first.
const HISTORY_LIMIT: usize = 256;
/// Payloads larger than this are kept as opaque bytes rather than text.
const MAX_TEXT_PAYLOAD: usize = 64 * 1024;
const LISTENER_BUFFER: usize = 64;

/// Payload as received from the broker. Parsing beyond UTF-8 validation is
/// the consumer's job, not the router's.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    /// Non-UTF8 or oversized payload, recorded as-is for diagnostics.
    Opaque(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Payload,
    pub received_at: NaiveDateTime,
}

impl TopicMessage {
    fn from_inbound(msg: InboundMessage) -> Self {
        let payload = if msg.payload.len() > MAX_TEXT_PAYLOAD {
            Payload::Opaque(msg.payload)
        } else {
            match String::from_utf8(msg.payload) {
                Ok(text) => Payload::Text(text),
                Err(e) => Payload::Opaque(e.into_bytes()),
            }
        };
        Self {
            topic: msg.topic,
            payload,
            received_at: chrono::Local::now().naive_local(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(s) => Some(s),
            Payload::Opaque(_) => None,
        }
    }
}

enum RouterCommand {
    Subscribe(String),
    Listen(String, mpsc::Sender<TopicMessage>),
    ListenAll(mpsc::Sender<TopicMessage>),
}

#[derive(Default)]
struct RouterCache {
    latest: RwLock<HashMap<String, TopicMessage>>,
    history: RwLock<HashMap<String, VecDeque<TopicMessage>>>,
}

/// Cheap clonable handle onto the router task.
#[derive(Clone)]
pub struct TopicRouter {
    cache: Arc<RouterCache>,
    commands: mpsc::Sender<RouterCommand>,
    cancel: CancellationToken,
}

impl TopicRouter {
    /// Spawn the router task over the connection's inbound feed.
    pub fn spawn(
        connection: Arc<ConnectionManager>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        let cache = Arc::new(RouterCache::default());
        let (commands, cmd_rx) = mpsc::channel(LISTENER_BUFFER);
        let cancel = CancellationToken::new();

        let worker = RouterWorker {
            cache: cache.clone(),
            connection,
            subscriptions: HashSet::new(),
            listeners: HashMap::new(),
            wildcard: Vec::new(),
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run(inbound_rx, cmd_rx));

        Self {
            cache,
            commands,
            cancel,
        }
    }

    /// Register interest in a topic. Duplicates are a no-op; topics queued
    /// before the connection is up are flushed once it connects.
    pub async fn subscribe(&self, topic: &str) {
        let _ = self
            .commands
            .send(RouterCommand::Subscribe(topic.to_string()))
            .await;
    }

    /// Ordered feed of messages for one exact topic.
    pub async fn listen(&self, topic: &str) -> mpsc::Receiver<TopicMessage> {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        let _ = self
            .commands
            .send(RouterCommand::Listen(topic.to_string(), tx))
            .await;
        rx
    }

    /// Ordered feed of every message the router sees.
    pub async fn listen_all(&self) -> mpsc::Receiver<TopicMessage> {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        let _ = self.commands.send(RouterCommand::ListenAll(tx)).await;
        rx
    }

    /// Most recent message for the exact topic, or `None` if nothing has
    /// arrived yet. Never blocks.
    pub fn latest(&self, topic: &str) -> Option<TopicMessage> {
        self.cache
            .latest
            .read()
            .expect("latest cache lock")
            .get(topic)
            .cloned()
    }

    /// Recent history for a topic, oldest first, capped at the ring size.
    pub fn recent(&self, topic: &str) -> Vec<TopicMessage> {
        self.cache
            .history
            .read()
            .expect("history lock")
            .get(topic)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stop the router task. Listeners observe channel closure.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct RouterWorker {
    cache: Arc<RouterCache>,
    connection: Arc<ConnectionManager>,
    subscriptions: HashSet<String>,
    listeners: HashMap<String, Vec<mpsc::Sender<TopicMessage>>>,
    wildcard: Vec<mpsc::Sender<TopicMessage>>,
    cancel: CancellationToken,
}

impl RouterWorker {
    async fn run(
        mut self,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        mut cmd_rx: mpsc::Receiver<RouterCommand>,
    ) {
        let mut state_rx = self.connection.watch_state();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Router shutting down");
                    break;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *state_rx.borrow_and_update() == ConnectionState::Connected {
                        self.flush_subscriptions().await;
                    }
                }
                msg = inbound_rx.recv() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => {
                        debug!("Inbound feed closed, router stopping");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, cmd: RouterCommand) {
        match cmd {
            RouterCommand::Subscribe(topic) => {
                if !self.subscriptions.insert(topic.clone()) {
                    debug!("Already subscribed to {}", topic);
                    return;
                }
                if self.connection.state() == ConnectionState::Connected {
                    self.connection.subscribe_topic(&topic).await;
                } else {
                    debug!("Queueing subscription to {} until connected", topic);
                }
            }
            RouterCommand::Listen(topic, tx) => {
                self.listeners.entry(topic).or_default().push(tx);
            }
            RouterCommand::ListenAll(tx) => {
                self.wildcard.push(tx);
            }
        }
    }

    /// Register the whole subscription set with the broker. Runs on every
    /// transition into `Connected`, which also covers resubscription after
    /// a reconnect.
    async fn flush_subscriptions(&self) {
        for topic in &self.subscriptions {
            self.connection.subscribe_topic(topic).await;
        }
    }

    async fn dispatch(&mut self, msg: InboundMessage) {
        let message = TopicMessage::from_inbound(msg);
        if matches!(message.payload, Payload::Opaque(_)) {
            warn!("Opaque payload on {} recorded unparsed", message.topic);
        }
        trace!("Routing message on {}", message.topic);

        {
            let mut history = self.cache.history.write().expect("history lock");
            let ring = history.entry(message.topic.clone()).or_default();
            if ring.len() == HISTORY_LIMIT {
                ring.pop_front();
            }
            ring.push_back(message.clone());
        }
        self.cache
            .latest
            .write()
            .expect("latest cache lock")
            .insert(message.topic.clone(), message.clone());

        if let Some(senders) = self.listeners.get_mut(&message.topic) {
            deliver(senders, &message).await;
        }
        deliver(&mut self.wildcard, &message).await;
    }
}

/// Deliver in order, pruning listeners that have gone away. Slow listeners
/// backpressure the router instead of seeing reordered or dropped messages.
async fn deliver(senders: &mut Vec<mpsc::Sender<TopicMessage>>, message: &TopicMessage) {
    let mut dropped = false;
    for sender in senders.iter() {
        if sender.send(message.clone()).await.is_err() {
            dropped = true;
        }
    }
    if dropped {
        senders.retain(|s| !s.is_closed());
    }
}
