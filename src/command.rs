//! # Command Executor
//!
//! Executes remote-control and remote-adjustment writes. Requests arrive
//! on an mpsc queue and run one at a time, in arrival order. Each write
//! takes the target channel's transport lock for exactly one request, so
//! it lands between two batch reads of that channel's poll cycle, never
//! inside one.
//!
//! ```text
//! queued → in_flight → acknowledged | failed | timed_out
//! ```
//!
//! Unknown targets, read-only points and channels in backoff fail without
//! touching the transport. Nothing is retried; that is the submitter's call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ModbusError;
use crate::message_log::{LogRecord, MessageLogger};
use crate::model::{Channel, LogLevel};
use crate::publisher::{DataPublisher, TelemetryStore};
use crate::scheduler::ChannelState;
use crate::transport::ModbusTransport;

/// A pending write for one point.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub channel_id: u16,
    pub point_id: u32,
    /// Device value, before the point's transform
    pub value: f64,
    pub submitted_at: DateTime<Utc>,
    pub correlation_id: String,
}

impl CommandRequest {
    pub fn new(
        channel_id: u16,
        point_id: u32,
        value: f64,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            channel_id,
            point_id,
            value,
            submitted_at: Utc::now(),
            correlation_id: correlation_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandStatus {
    Queued,
    InFlight,
    Acknowledged,
    Failed,
    TimedOut,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a command as seen by its submitter.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub correlation_id: String,
    pub status: CommandStatus,
    /// Set once the status is terminal
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

// ============================================================================
// Status board
// ============================================================================

/// Correlation id → latest status. Terminal outcomes are also broadcast.
#[derive(Debug)]
pub struct CommandStatusBoard {
    entries: DashMap<String, CommandOutcome>,
    completed: broadcast::Sender<CommandOutcome>,
}

impl Default for CommandStatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandStatusBoard {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            completed: broadcast::channel(256).0,
        }
    }

    fn set(&self, correlation_id: &str, status: CommandStatus, message: Option<String>) {
        let outcome = CommandOutcome {
            correlation_id: correlation_id.to_string(),
            status,
            completed_at: status.is_terminal().then(Utc::now),
            message,
        };
        self.entries
            .insert(correlation_id.to_string(), outcome.clone());
        if status.is_terminal() {
            // No subscribers is fine; the board keeps the outcome
            let _ = self.completed.send(outcome);
        }
    }

    pub fn get(&self, correlation_id: &str) -> Option<CommandOutcome> {
        self.entries.get(correlation_id).map(|e| e.value().clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommandOutcome> {
        self.completed.subscribe()
    }

    /// Wait until `correlation_id` reaches a terminal status.
    pub async fn wait_for(&self, correlation_id: &str) -> Option<CommandOutcome> {
        let mut rx = self.subscribe();
        if let Some(outcome) = self.get(correlation_id).filter(|o| o.status.is_terminal()) {
            return Some(outcome);
        }
        loop {
            match rx.recv().await {
                Ok(outcome) if outcome.correlation_id == correlation_id => return Some(outcome),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(outcome) =
                        self.get(correlation_id).filter(|o| o.status.is_terminal())
                    {
                        return Some(outcome);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Forget terminal outcomes completed before `cutoff`.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, o| o.completed_at.map_or(true, |at| at >= cutoff));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Periodically forget outcomes that finished more than `ttl` ago.
pub fn spawn_prune_task(
    board: Arc<CommandStatusBoard>,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // A ttl too large for chrono never expires anything
            let Some(cutoff) = chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
            else {
                continue;
            };
            let removed = board.prune(cutoff);
            if removed > 0 {
                debug!("Pruned {} finished command outcomes", removed);
            }
        }
    })
}

// ============================================================================
// Queue
// ============================================================================

/// Submitting side of the command queue.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<CommandRequest>,
    board: Arc<CommandStatusBoard>,
}

impl CommandQueue {
    pub fn new(capacity: usize, board: Arc<CommandStatusBoard>) -> (Self, mpsc::Receiver<CommandRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, board }, rx)
    }

    /// Enqueue a request. Waits for queue space; fails only when the
    /// executor has shut down.
    pub async fn submit(&self, request: CommandRequest) -> Result<(), CommandRequest> {
        let correlation_id = request.correlation_id.clone();
        self.board.set(&correlation_id, CommandStatus::Queued, None);
        self.tx.send(request).await.map_err(|e| {
            self.board.set(
                &correlation_id,
                CommandStatus::Failed,
                Some("command executor stopped".into()),
            );
            e.0
        })
    }

    pub fn board(&self) -> &Arc<CommandStatusBoard> {
        &self.board
    }
}

// ============================================================================
// Executor
// ============================================================================

/// What the executor needs to reach one channel.
pub struct ChannelHandle<T> {
    pub channel: Arc<Channel>,
    pub transport: Arc<Mutex<T>>,
    pub state: watch::Receiver<ChannelState>,
}

impl<T> Clone for ChannelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            transport: Arc::clone(&self.transport),
            state: self.state.clone(),
        }
    }
}

/// Channels reachable by commands, swapped by the engine on reload.
pub type ChannelRegistry<T> = Arc<RwLock<HashMap<u16, ChannelHandle<T>>>>;

pub struct CommandExecutor<T: ModbusTransport, S: TelemetryStore> {
    channels: ChannelRegistry<T>,
    board: Arc<CommandStatusBoard>,
    publisher: DataPublisher<S>,
    logger: MessageLogger,
}

impl<T: ModbusTransport, S: TelemetryStore> CommandExecutor<T, S> {
    pub fn new(
        channels: ChannelRegistry<T>,
        board: Arc<CommandStatusBoard>,
        publisher: DataPublisher<S>,
        logger: MessageLogger,
    ) -> Self {
        Self {
            channels,
            board,
            publisher,
            logger,
        }
    }

    /// Drain the queue until every [`CommandQueue`] is dropped or `cancel`
    /// fires. A command already taken off the queue runs to completion.
    pub async fn run(self, mut rx: mpsc::Receiver<CommandRequest>, cancel: CancellationToken) {
        info!("Command executor started");
        let mut executed = 0u64;
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.execute(&request).await;
            executed += 1;
        }

        // Whatever is still queued will never run
        rx.close();
        while let Ok(request) = rx.try_recv() {
            self.board.set(
                &request.correlation_id,
                CommandStatus::Failed,
                Some("command executor stopped".into()),
            );
        }
        info!("Command executor stopped after {} commands", executed);
    }

    /// Execute one request and publish its terminal status.
    pub async fn execute(&self, request: &CommandRequest) -> CommandOutcome {
        let id = request.correlation_id.as_str();
        let (status, message) = self.dispatch(request).await;

        match status {
            CommandStatus::Acknowledged => debug!(
                "Command {} acknowledged: channel {} point {} = {}",
                id, request.channel_id, request.point_id, request.value
            ),
            _ => warn!(
                "Command {} {}: channel {} point {}: {}",
                id,
                status,
                request.channel_id,
                request.point_id,
                message.as_deref().unwrap_or("")
            ),
        }
        self.board.set(id, status, message);
        self.board.get(id).unwrap_or(CommandOutcome {
            correlation_id: id.to_string(),
            status,
            completed_at: Some(Utc::now()),
            message: None,
        })
    }

    async fn dispatch(&self, request: &CommandRequest) -> (CommandStatus, Option<String>) {
        let handle = self.channels.read().get(&request.channel_id).cloned();
        let Some(handle) = handle else {
            return (
                CommandStatus::Failed,
                Some(format!("unknown channel {}", request.channel_id)),
            );
        };
        let Some(point) = handle.channel.point(request.point_id) else {
            return (
                CommandStatus::Failed,
                Some(format!(
                    "unknown point {} on channel {}",
                    request.point_id, request.channel_id
                )),
            );
        };
        if !point.is_writable() {
            return (
                CommandStatus::Failed,
                Some(format!("point {} is not writable", point.id)),
            );
        }
        let state = *handle.state.borrow();
        if state.rejects_commands() {
            return (
                CommandStatus::Failed,
                Some(format!("channel {} is in {}", request.channel_id, state)),
            );
        }
        let words = match point.data_type.encode(request.value, point.byte_order) {
            Ok(words) => words,
            Err(e) => return (CommandStatus::Failed, Some(e.to_string())),
        };

        self.board.set(&request.correlation_id, CommandStatus::InFlight, None);
        let capture = handle.channel.log.level == LogLevel::Debug;
        let started = Instant::now();
        let (result, frames) = {
            let mut transport = handle.transport.lock().await;
            let result = transport.execute_write(point, &words).await;
            let frames = capture.then(|| {
                let (req, resp) = transport.last_frames();
                (req.to_vec(), resp.to_vec())
            });
            (result, frames)
        };

        let mut record = LogRecord::write(handle.channel.id, point, &request.correlation_id)
            .with_latency(started.elapsed());
        if let Err(err) = &result {
            record = record.with_error(err);
        }
        if let Some((req, resp)) = &frames {
            record = record.with_payloads(req, resp);
        }
        self.logger.log(record);

        match result {
            Ok(()) => {
                let echoed = point.data_type.decode(&words, point.byte_order, None);
                let value = echoed.unwrap_or(request.value);
                self.publisher.publish_ack(
                    handle.channel.id,
                    point.category,
                    point.id,
                    point.transform.apply(value, point.data_type),
                );
                (CommandStatus::Acknowledged, None)
            }
            Err(err @ ModbusError::Timeout { .. }) => (CommandStatus::TimedOut, Some(err.to_string())),
            Err(err) => (CommandStatus::Failed, Some(err.to_string())),
        }
    }
}
