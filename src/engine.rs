//! # Acquisition Engine
//!
//! Wires the pieces together: one [`ChannelPoller`] task per channel, a
//! single [`CommandExecutor`] task, the message log writer and its
//! retention sweep. All of them share the telemetry store and the
//! message logger; nothing else crosses channel boundaries.
//!
//! [`Engine::reload`] applies a new channel list:
//!
//! - unchanged channels keep running untouched
//! - channels whose only change is the point list get a new batch plan,
//!   picked up by the poller at the start of its next cycle
//! - channels with changed transport or timing are stopped and restarted
//! - channels that disappeared, or no longer validate, are stopped
//!
//! Stopping a channel lets its in-flight request finish or time out
//! before the transport is closed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{
    spawn_prune_task, ChannelHandle, ChannelRegistry, CommandExecutor, CommandQueue,
    CommandRequest, CommandStatusBoard,
};
use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError};
use crate::message_log::{spawn_retention_task, LogPolicies, LogWriter, MessageLogger};
use crate::model::Channel;
use crate::planner::{BatchPlan, BatchPlanner};
use crate::publisher::{DataPublisher, TelemetryStore};
use crate::scheduler::{ChannelPoller, ChannelState, CycleReport};
use crate::transport::{ChannelTransport, ModbusTransport, TransportStats};

/// Engine-wide settings, independent of any channel.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub log_dir: PathBuf,
    pub log_queue_capacity: usize,
    pub retention_sweep_interval: Duration,
    pub command_queue_capacity: usize,
    pub command_status_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            log_dir: config.log_dir.clone(),
            log_queue_capacity: config.log_queue_capacity,
            retention_sweep_interval: config.retention_sweep_interval(),
            command_queue_capacity: config.command_queue_capacity,
            command_status_ttl: config.command_status_ttl(),
        }
    }
}

/// What a reload did, per channel id.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReloadReport {
    pub started: Vec<u16>,
    pub replanned: Vec<u16>,
    pub restarted: Vec<u16>,
    pub unchanged: Vec<u16>,
    pub stopped: Vec<u16>,
    pub rejected: Vec<ConfigError>,
}

/// Snapshot of one running channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub id: u16,
    pub name: String,
    pub state: ChannelState,
    pub points: usize,
    pub batches: usize,
    pub last_report: Option<CycleReport>,
    pub transport: TransportStats,
}

struct RunningChannel {
    channel: Arc<Channel>,
    transport: Arc<Mutex<ChannelTransport>>,
    plan: watch::Sender<Arc<BatchPlan>>,
    state: watch::Receiver<ChannelState>,
    reports: watch::Receiver<Option<CycleReport>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Engine<S: TelemetryStore> {
    settings: EngineSettings,
    publisher: DataPublisher<S>,
    logger: MessageLogger,
    policies: LogPolicies,
    registry: ChannelRegistry<ChannelTransport>,
    running: HashMap<u16, RunningChannel>,
    commands: CommandQueue,
    board: Arc<CommandStatusBoard>,
    cancel: CancellationToken,
    executor: JoinHandle<()>,
    writer: JoinHandle<()>,
    retention: JoinHandle<()>,
    prune: JoinHandle<()>,
}

impl<S: TelemetryStore> Engine<S> {
    /// Spawn the background tasks. Channels are added with [`Engine::reload`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(settings: EngineSettings, store: Arc<S>) -> Self {
        if let Err(e) = std::fs::create_dir_all(&settings.log_dir) {
            // Records for this root will be dropped by the writer
            warn!(
                "Message log directory {} unusable: {}",
                settings.log_dir.display(),
                e
            );
        }

        let cancel = CancellationToken::new();
        let publisher = DataPublisher::new(store);
        let policies: LogPolicies = Arc::new(RwLock::new(HashMap::new()));

        let (logger, log_rx) = MessageLogger::new(settings.log_queue_capacity);
        let writer = LogWriter::new(settings.log_dir.clone(), Arc::clone(&policies));
        let active = writer.active_segments();
        let writer = writer.spawn(log_rx);
        let retention = spawn_retention_task(
            settings.log_dir.clone(),
            Arc::clone(&policies),
            active,
            settings.retention_sweep_interval,
            cancel.child_token(),
        );

        let registry: ChannelRegistry<ChannelTransport> = Arc::new(RwLock::new(HashMap::new()));
        let board = Arc::new(CommandStatusBoard::new());
        let (commands, command_rx) =
            CommandQueue::new(settings.command_queue_capacity, Arc::clone(&board));
        let executor = CommandExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&board),
            publisher.clone(),
            logger.clone(),
        );
        let executor = tokio::spawn(executor.run(command_rx, cancel.child_token()));
        let prune = spawn_prune_task(
            Arc::clone(&board),
            settings.command_status_ttl,
            settings
                .command_status_ttl
                .clamp(Duration::from_millis(10), Duration::from_secs(60)),
            cancel.child_token(),
        );

        info!("Engine started, message logs in {}", settings.log_dir.display());
        Self {
            settings,
            publisher,
            logger,
            policies,
            registry,
            running: HashMap::new(),
            commands,
            board,
            cancel,
            executor,
            writer,
            retention,
            prune,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<S> {
        self.publisher.store()
    }

    /// Cloneable submitting side of the command queue.
    pub fn command_queue(&self) -> CommandQueue {
        self.commands.clone()
    }

    pub fn status_board(&self) -> &Arc<CommandStatusBoard> {
        &self.board
    }

    pub async fn submit(&self, request: CommandRequest) -> Result<(), EngineError> {
        self.commands
            .submit(request)
            .await
            .map_err(|request| EngineError::CommandQueueClosed {
                correlation_id: request.correlation_id,
            })
    }

    /// Log records dropped because the writer fell behind.
    pub fn dropped_log_records(&self) -> u64 {
        self.logger.dropped()
    }

    pub fn channel_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// State watch of a running channel.
    pub fn channel_state(&self, channel_id: u16) -> Option<watch::Receiver<ChannelState>> {
        self.running.get(&channel_id).map(|r| r.state.clone())
    }

    /// Cycle report watch of a running channel.
    pub fn channel_reports(
        &self,
        channel_id: u16,
    ) -> Option<watch::Receiver<Option<CycleReport>>> {
        self.running.get(&channel_id).map(|r| r.reports.clone())
    }

    /// Waits for the channel's transport lock, so at most one request.
    pub async fn channel_status(&self, channel_id: u16) -> Option<ChannelStatus> {
        let running = self.running.get(&channel_id)?;
        let transport = running.transport.lock().await.stats();
        let last_report = running.reports.borrow().clone();
        let batches = running.plan.borrow().len();
        Some(ChannelStatus {
            id: running.channel.id,
            name: running.channel.name.clone(),
            state: *running.state.borrow(),
            points: running.channel.points().len(),
            batches,
            last_report,
            transport,
        })
    }

    /// Apply a new channel list; see the module docs for the rules.
    pub async fn reload(&mut self, channels: Vec<Channel>) -> ReloadReport {
        let mut report = ReloadReport::default();
        let wanted: HashSet<u16> = channels.iter().map(|c| c.id).collect();

        let removed: Vec<u16> = self
            .running
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for id in removed {
            self.stop_channel(id, true).await;
            report.stopped.push(id);
        }

        for channel in channels {
            let id = channel.id;
            let plan = match BatchPlanner::new(channel.limits).plan(id, channel.points()) {
                Ok(plan) => plan,
                Err(err) => {
                    warn!("Channel {} excluded from polling: {}", id, err);
                    if self.running.contains_key(&id) {
                        self.stop_channel(id, true).await;
                        report.stopped.push(id);
                    }
                    report.rejected.push(err);
                    continue;
                }
            };

            let existing = self
                .running
                .get(&id)
                .map(|r| {
                (
                    r.channel.as_ref() == &channel,
                    r.channel.same_runtime_settings(&channel),
                )
            });
            match existing {
                Some((true, _)) => report.unchanged.push(id),
                Some((false, true)) => {
                    self.replan_channel(channel, plan);
                    report.replanned.push(id);
                }
                Some((false, false)) => {
                    self.stop_channel(id, false).await;
                    match self.start_channel(channel, plan) {
                        Ok(()) => report.restarted.push(id),
                        Err(err) => {
                            report.stopped.push(id);
                            report.rejected.push(err);
                        }
                    }
                }
                None => match self.start_channel(channel, plan) {
                    Ok(()) => report.started.push(id),
                    Err(err) => report.rejected.push(err),
                },
            }
        }

        info!(
            "Reload: {} started, {} replanned, {} restarted, {} unchanged, {} stopped, {} rejected",
            report.started.len(),
            report.replanned.len(),
            report.restarted.len(),
            report.unchanged.len(),
            report.stopped.len(),
            report.rejected.len()
        );
        report
    }

    fn start_channel(&mut self, channel: Channel, plan: BatchPlan) -> Result<(), ConfigError> {
        let id = channel.id;
        let transport = ChannelTransport::for_channel(&channel)
            .map_err(|e| ConfigError::invalid_channel(id, e.to_string()))?;
        let transport = Arc::new(Mutex::new(transport));
        let channel = Arc::new(channel);

        self.policies.write().insert(id, channel.log);
        let (plan_tx, plan_rx) = watch::channel(Arc::new(plan));
        let cancel = self.cancel.child_token();
        let poller = ChannelPoller::new(
            Arc::clone(&channel),
            Arc::clone(&transport),
            plan_rx,
            self.publisher.clone(),
            self.logger.clone(),
            cancel.clone(),
        );
        let state = poller.state();
        let reports = poller.reports();
        let task = tokio::spawn(poller.run());

        self.registry.write().insert(
            id,
            ChannelHandle {
                channel: Arc::clone(&channel),
                transport: Arc::clone(&transport),
                state: state.clone(),
            },
        );
        self.running.insert(
            id,
            RunningChannel {
                channel,
                transport,
                plan: plan_tx,
                state,
                reports,
                cancel,
                task,
            },
        );
        Ok(())
    }

    /// Swap the plan of a running channel; takes effect between cycles.
    fn replan_channel(&mut self, channel: Channel, plan: BatchPlan) {
        let Some(running) = self.running.get_mut(&channel.id) else {
            return;
        };
        let id = channel.id;
        info!(
            "Channel {} replanned: {} points in {} batches",
            id,
            channel.points().len(),
            plan.len()
        );
        running.plan.send_replace(Arc::new(plan));
        running.channel = Arc::new(channel);
        self.registry.write().insert(
            id,
            ChannelHandle {
                channel: Arc::clone(&running.channel),
                transport: Arc::clone(&running.transport),
                state: running.state.clone(),
            },
        );
    }

    /// Cancel the poller, wait for it, close the transport. `forget`
    /// also drops the channel's values and log policy.
    async fn stop_channel(&mut self, channel_id: u16, forget: bool) {
        let Some(running) = self.running.remove(&channel_id) else {
            return;
        };
        self.registry.write().remove(&channel_id);

        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!("Channel {} poller ended abnormally: {}", channel_id, e);
        }
        if let Err(e) = running.transport.lock().await.close().await {
            warn!("Channel {} close failed: {}", channel_id, e);
        }
        if forget {
            self.policies.write().remove(&channel_id);
            self.publisher.store().remove_channel(channel_id);
        }
        info!("Channel {} stopped", channel_id);
    }

    /// Stop everything. In-flight requests finish or time out first;
    /// queued log records are flushed.
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        info!("Engine shutting down");
        self.cancel.cancel();

        let ids: Vec<u16> = self.running.keys().copied().collect();
        for id in ids {
            self.stop_channel(id, false).await;
        }

        let Self {
            logger,
            commands,
            executor,
            writer,
            retention,
            prune,
            ..
        } = self;

        let mut failures = Vec::new();
        for (task, handle) in [
            ("command executor", executor),
            ("log retention", retention),
            ("command status prune", prune),
        ] {
            if let Err(e) = handle.await {
                failures.push((task, e.to_string()));
            }
        }
        drop(commands);
        drop(logger);
        if let Err(e) = writer.await {
            failures.push(("message log writer", e.to_string()));
        }

        info!("Engine stopped");
        match failures.into_iter().next() {
            None => Ok(()),
            Some((task, message)) => Err(EngineError::Task {
                task: task.to_string(),
                message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::model::{Point, TransportConfig};
    use crate::publisher::MemoryTelemetryStore;
    use crate::DeviceLimits;

    fn settings(dir: &std::path::Path) -> EngineSettings {
        EngineSettings {
            log_dir: dir.to_path_buf(),
            ..EngineSettings::default()
        }
    }

    fn channel(id: u16, port: u16, points: usize) -> Channel {
        Channel::new(id, format!("ch{}", id), TransportConfig::tcp("127.0.0.1", port))
            .with_polling_interval(Duration::from_secs(3600))
            .with_limits(DeviceLimits::new().with_max_read_registers(20))
            .with_points(
                (0..points as u32)
                    .map(|i| Point::new(i, 1, i as u16, DataType::UInt16))
                    .collect(),
            )
    }

    #[tokio::test]
    async fn test_reload_classifies_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::start(settings(dir.path()), Arc::new(MemoryTelemetryStore::new()));

        let first = engine
            .reload(vec![channel(1, 1, 10), channel(2, 1, 10), channel(3, 1, 10)])
            .await;
        assert_eq!(first.started, vec![1, 2, 3]);
        assert_eq!(engine.channel_ids(), vec![1, 2, 3]);

        let too_wide = channel(3, 1, 0)
            .with_points(vec![Point::new(1, 1, 0, DataType::Float64)])
            .with_limits(DeviceLimits::new().with_max_read_registers(2));
        let second = engine
            .reload(vec![
                channel(1, 1, 10),
                channel(2, 1, 50),
                too_wide,
                channel(4, 2, 1),
            ])
            .await;
        assert_eq!(second.unchanged, vec![1]);
        assert_eq!(second.replanned, vec![2]);
        assert_eq!(second.stopped, vec![3]);
        assert_eq!(second.started, vec![4]);
        assert_eq!(second.rejected.len(), 1);
        assert_eq!(engine.channel_ids(), vec![1, 2, 4]);

        let status = engine.channel_status(2).await.unwrap();
        assert_eq!(status.points, 50);
        assert_eq!(status.batches, 3);

        let third = engine
            .reload(vec![channel(1, 1, 10).with_polling_interval(Duration::from_secs(5))])
            .await;
        assert_eq!(third.restarted, vec![1]);
        assert_eq!(third.stopped.len(), 2);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails_command() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::start(settings(dir.path()), Arc::new(MemoryTelemetryStore::new()));
        let queue = engine.command_queue();
        let board = Arc::clone(engine.status_board());
        engine.shutdown().await.unwrap();

        let rejected = queue.submit(CommandRequest::new(1, 1, 1.0, "late")).await;
        assert!(rejected.is_err());
        assert_eq!(
            board.get("late").map(|o| o.status),
            Some(crate::command::CommandStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_finished_commands_expire_from_board() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings {
            command_status_ttl: Duration::from_millis(20),
            ..settings(dir.path())
        };
        let engine = Engine::start(settings, Arc::new(MemoryTelemetryStore::new()));

        engine
            .submit(CommandRequest::new(42, 1, 1.0, "no-such-channel"))
            .await
            .unwrap();
        let outcome = engine.status_board().wait_for("no-such-channel").await;
        assert_eq!(
            outcome.map(|o| o.status),
            Some(crate::command::CommandStatus::Failed)
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(engine.status_board().get("no-such-channel").is_none());
        engine.shutdown().await.unwrap();
    }
}
