//! Async driver for the dispensing-run ledger.
//!
//! Owns a `CycleStateMachine`, feeds it from the routed weight topic and
//! publishes a `RunSnapshot` on a watch channel for the UI, plus discrete
//! `CycleEvent`s on a broadcast channel for the backend collaborator.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::machine::{
    BackendRow, CycleRecord, CycleStateMachine, RunPhase, SampleOutcome, StartError, StartNotice,
};
use crate::broker::{CommandPublisher, TopicMessage};
use crate::config::topics;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Payload the device expects on the start command topic.
const START_PAYLOAD: &str = "Start";

#[derive(Clone, Debug, PartialEq)]
pub enum CycleEvent {
    Started(StartNotice),
    /// A record was appended to the run's log.
    Record(CycleRecord),
    /// The run reached zero; rows are shaped for the backend handoff.
    Completed { rows: Vec<BackendRow> },
}

/// Point-in-time view of the run for the UI.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RunSnapshot {
    pub phase: RunPhase,
    pub initial_weight: Option<f64>,
    pub remaining_weight: Option<f64>,
    pub remaining_percent: Option<f64>,
    pub records: Vec<CycleRecord>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CycleCommandError {
    #[error(transparent)]
    Start(#[from] StartError),
    #[error("cycle worker is not running")]
    WorkerGone,
}

enum CycleCommand {
    SetInitialWeight(f64),
    Start(oneshot::Sender<Result<StartNotice, StartError>>),
    Reset,
}

/// Handle onto the cycle worker task.
#[derive(Clone)]
pub struct CycleHandle {
    commands: mpsc::Sender<CycleCommand>,
    snapshot_rx: watch::Receiver<RunSnapshot>,
    events_tx: broadcast::Sender<CycleEvent>,
    cancel: CancellationToken,
}

impl CycleHandle {
    /// Spawn the worker over a routed weight feed.
    pub fn spawn(
        samples: mpsc::Receiver<TopicMessage>,
        publisher: Arc<CommandPublisher>,
    ) -> Self {
        let (commands, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(RunSnapshot::default());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let worker = CycleWorker {
            machine: CycleStateMachine::new(),
            publisher,
            snapshot_tx,
            events_tx: events_tx.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run(samples, cmd_rx));

        Self {
            commands,
            snapshot_rx,
            events_tx,
            cancel,
        }
    }

    pub async fn set_initial_weight(&self, grams: f64) {
        let _ = self
            .commands
            .send(CycleCommand::SetInitialWeight(grams))
            .await;
    }

    /// Start a run: validates the initial weight, clears the prior log and
    /// issues the start command to the device.
    pub async fn start(&self) -> Result<StartNotice, CycleCommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(CycleCommand::Start(reply_tx))
            .await
            .map_err(|_| CycleCommandError::WorkerGone)?;
        let outcome = reply_rx.await.map_err(|_| CycleCommandError::WorkerGone)?;
        Ok(outcome?)
    }

    pub async fn reset(&self) {
        let _ = self.commands.send(CycleCommand::Reset).await;
    }

    /// Current run state; never blocks.
    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch run-state changes.
    pub fn watch(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Subscribe to run events (records, completion).
    pub fn events(&self) -> broadcast::Receiver<CycleEvent> {
        self.events_tx.subscribe()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct CycleWorker {
    machine: CycleStateMachine,
    publisher: Arc<CommandPublisher>,
    snapshot_tx: watch::Sender<RunSnapshot>,
    events_tx: broadcast::Sender<CycleEvent>,
    cancel: CancellationToken,
}

impl CycleWorker {
    async fn run(
        mut self,
        mut samples: mpsc::Receiver<TopicMessage>,
        mut cmd_rx: mpsc::Receiver<CycleCommand>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Cycle worker shutting down");
                    break;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                msg = samples.recv() => match msg {
                    Some(msg) => self.handle_sample(msg),
                    None => {
                        debug!("Weight feed closed, cycle worker stopping");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, cmd: CycleCommand) {
        match cmd {
            CycleCommand::SetInitialWeight(grams) => {
                self.machine.set_initial_weight(grams);
                self.publish_snapshot();
            }
            CycleCommand::Start(reply) => {
                let outcome = self.machine.start();
                if let Ok(notice) = &outcome {
                    info!(
                        "Run started with initial weight {} g{}",
                        notice.initial_weight,
                        if notice.post_reset { " (first after reset)" } else { "" }
                    );
                    self.publisher
                        .send(topics::FEEDER_START, START_PAYLOAD)
                        .await
                        .ok();
                    let _ = self.events_tx.send(CycleEvent::Started(*notice));
                    self.publish_snapshot();
                }
                let _ = reply.send(outcome);
            }
            CycleCommand::Reset => {
                self.machine.reset();
                info!("Run reset");
                self.publish_snapshot();
            }
        }
    }

    fn handle_sample(&mut self, msg: TopicMessage) {
        let Some(raw) = msg.text() else {
            debug!("Dropping non-text weight payload on {}", msg.topic);
            return;
        };
        let dropped = match raw.trim().parse::<f64>() {
            Ok(value) if value.is_finite() && value >= 0.0 => value,
            Ok(value) => {
                debug!("Dropping out-of-range weight sample {}", value);
                return;
            }
            Err(_) => {
                debug!("Dropping non-numeric weight sample {:?}", raw);
                return;
            }
        };

        match self.machine.on_sample(dropped) {
            SampleOutcome::Ignored => {}
            SampleOutcome::Recorded(record) => {
                let _ = self.events_tx.send(CycleEvent::Record(record));
                self.publish_snapshot();
            }
            SampleOutcome::RunCompleted(record) => {
                info!("Run complete after cycle {}", record.cycle);
                let _ = self.events_tx.send(CycleEvent::Record(record));
                let _ = self.events_tx.send(CycleEvent::Completed {
                    rows: self.machine.backend_rows(),
                });
                self.publish_snapshot();
            }
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(RunSnapshot {
            phase: self.machine.phase(),
            initial_weight: self.machine.initial_weight(),
            remaining_weight: self.machine.remaining_weight(),
            remaining_percent: self.machine.remaining_percent(),
            records: self.machine.records().to_vec(),
        });
    }
}
