//! # Poll Scheduler
//!
//! One [`ChannelPoller`] task per channel:
//!
//! ```text
//! idle → connecting → polling ⇄ backoff
//!            ↑            │
//!            └────────────┘ (link lost)        any state → stopped
//! ```
//!
//! Each cycle walks the batch plan in order. The transport lock is taken
//! for exactly one request at a time, so a command write can slip in
//! between two batch reads but never inside one. A failed batch is retried
//! up to the channel's attempt bound, then its points are left stale and
//! the cycle moves on. Values are published once, at the end of the cycle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{CycleBackoff, CycleOutcome};
use crate::error::ModbusError;
use crate::message_log::{LogRecord, MessageLogger};
use crate::model::{Channel, LogLevel};
use crate::planner::{BatchPlan, DecodedValue, ReadBatch};
use crate::publisher::{DataPublisher, TelemetryStore};
use crate::transport::ModbusTransport;

/// Lifecycle state of a channel, as published on its watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Polling,
    /// Every batch of the last cycle(s) failed; interval is stretched
    Backoff,
    Stopped,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Polling => "polling",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        }
    }

    /// Commands are rejected outright in these states.
    #[inline]
    pub fn rejects_commands(&self) -> bool {
        matches!(self, Self::Backoff | Self::Stopped)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate result of one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub batches_ok: usize,
    pub batches_failed: usize,
    pub points_updated: usize,
    pub duration: Duration,
    /// Wait before the next cycle starts, backoff included
    pub next_interval: Duration,
}

impl CycleReport {
    pub fn outcome(&self) -> CycleOutcome {
        if self.batches_failed == 0 {
            CycleOutcome::AllSucceeded
        } else if self.batches_ok == 0 {
            CycleOutcome::AllFailed
        } else {
            CycleOutcome::Partial
        }
    }
}

/// Per-channel polling loop.
pub struct ChannelPoller<T: ModbusTransport, S: TelemetryStore> {
    channel: Arc<Channel>,
    transport: Arc<Mutex<T>>,
    plan: watch::Receiver<Arc<BatchPlan>>,
    publisher: DataPublisher<S>,
    logger: MessageLogger,
    state: watch::Sender<ChannelState>,
    reports: watch::Sender<Option<CycleReport>>,
    cancel: CancellationToken,
    backoff: CycleBackoff,
    cycles: u64,
}

impl<T: ModbusTransport, S: TelemetryStore> ChannelPoller<T, S> {
    pub fn new(
        channel: Arc<Channel>,
        transport: Arc<Mutex<T>>,
        plan: watch::Receiver<Arc<BatchPlan>>,
        publisher: DataPublisher<S>,
        logger: MessageLogger,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = CycleBackoff::new(
            channel.polling_interval,
            channel.retry.backoff_multiplier,
            channel.retry.backoff_cap,
        );
        Self {
            channel,
            transport,
            plan,
            publisher,
            logger,
            state: watch::channel(ChannelState::Idle).0,
            reports: watch::channel(None).0,
            cancel,
            backoff,
            cycles: 0,
        }
    }

    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn reports(&self) -> watch::Receiver<Option<CycleReport>> {
        self.reports.subscribe()
    }

    fn set_state(&self, next: ChannelState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!("Channel {} state {} -> {}", self.channel.id, current, next);
                *current = next;
                true
            }
        });
    }

    /// Poll until cancelled. Cycles start on a fixed cadence measured
    /// from the previous cycle's start.
    pub async fn run(mut self) {
        info!(
            "Channel {} ({}) polling every {:?} over {} batches",
            self.channel.id,
            self.channel.name,
            self.channel.polling_interval,
            self.plan.borrow().len()
        );

        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            let report = self.poll_cycle().await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(started + report.next_interval) => {}
            }
        }

        self.set_state(ChannelState::Stopped);
        info!("Channel {} polling stopped after {} cycles", self.channel.id, self.cycles);
    }

    /// Execute one full pass over the current plan and publish its values.
    pub async fn poll_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let plan = Arc::clone(&self.plan.borrow_and_update());
        let started = Instant::now();

        let mut values: Vec<DecodedValue> = Vec::with_capacity(plan.point_count());
        let mut batches_ok = 0;
        let mut batches_failed = 0;

        if !plan.is_empty() {
            if self.ensure_connected().await {
                let delay = self.channel.limits.inter_request_delay();
                for (i, batch) in plan.batches().iter().enumerate() {
                    if self.cancel.is_cancelled() {
                        debug!("Channel {} cycle cancelled before batch {}", self.channel.id, i);
                        break;
                    }
                    if i > 0 && !delay.is_zero() {
                        sleep(delay).await;
                    }
                    match self.read_batch(batch).await {
                        Some(decoded) => {
                            batches_ok += 1;
                            values.extend(decoded);
                        }
                        None => batches_failed += 1,
                    }
                }
            } else {
                batches_failed = plan.len();
            }
        }

        let points_updated = self.publisher.publish_cycle(self.channel.id, &values);
        let mut report = CycleReport {
            cycle: self.cycles,
            batches_ok,
            batches_failed,
            points_updated,
            duration: started.elapsed(),
            next_interval: Duration::ZERO,
        };

        let was_backing_off = self.backoff.is_backing_off();
        report.next_interval = self.backoff.on_cycle(report.outcome());
        if self.backoff.is_backing_off() {
            if !was_backing_off {
                warn!(
                    "Channel {}: all {} batches failed, backing off to {:?}",
                    self.channel.id, batches_failed, report.next_interval
                );
            }
            self.set_state(ChannelState::Backoff);
        } else {
            if was_backing_off {
                info!("Channel {} recovered, normal interval restored", self.channel.id);
            }
            self.set_state(ChannelState::Polling);
        }

        debug!(
            "Channel {} cycle {}: {} ok, {} failed, {} points in {:?}",
            self.channel.id,
            report.cycle,
            report.batches_ok,
            report.batches_failed,
            report.points_updated,
            report.duration
        );
        self.reports.send_replace(Some(report.clone()));
        report
    }

    async fn ensure_connected(&self) -> bool {
        let mut transport = self.transport.lock().await;
        if transport.is_connected() {
            return true;
        }

        self.set_state(ChannelState::Connecting);
        let started = Instant::now();
        let result = transport.connect().await;
        drop(transport);

        match result {
            Ok(()) => {
                if !self.backoff.is_backing_off() {
                    self.set_state(ChannelState::Polling);
                }
                true
            }
            Err(ModbusError::Backoff { retry_in_ms }) => {
                debug!(
                    "Channel {} reconnect suppressed for {}ms",
                    self.channel.id, retry_in_ms
                );
                false
            }
            Err(err) => {
                warn!("Channel {} connect failed: {}", self.channel.id, err);
                self.logger.log(
                    LogRecord::connect(self.channel.id)
                        .with_error(&err)
                        .with_latency(started.elapsed()),
                );
                false
            }
        }
    }

    /// Read and decode one batch with retries. Emits exactly one log
    /// record for the batch's final outcome.
    async fn read_batch(&self, batch: &ReadBatch) -> Option<Vec<DecodedValue>> {
        let attempts = self.channel.retry.attempts.max(1);
        let capture = self.channel.log.level == LogLevel::Debug;
        let started = Instant::now();
        let mut made = 0;
        let mut failure: Option<(ModbusError, Option<(Vec<u8>, Vec<u8>)>)> = None;

        while made < attempts {
            made += 1;
            let (result, frames) = {
                let mut transport = self.transport.lock().await;
                let result = transport.execute_read(batch).await;
                let frames = capture.then(|| {
                    let (req, resp) = transport.last_frames();
                    (req.to_vec(), resp.to_vec())
                });
                (result, frames)
            };

            match result.and_then(|words| batch.decode(&words)) {
                Ok(decoded) => {
                    let mut record = LogRecord::read(self.channel.id, batch)
                        .with_attempts(made)
                        .with_latency(started.elapsed());
                    if let Some((req, resp)) = &frames {
                        record = record.with_payloads(req, resp);
                    }
                    self.logger.log(record);
                    return Some(decoded);
                }
                Err(err) => {
                    if made < attempts {
                        warn!(
                            "Channel {} batch {} attempt {}/{} failed: {}",
                            self.channel.id, batch.index, made, attempts, err
                        );
                        failure = Some((err, frames));
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = sleep(self.channel.retry.delay) => {}
                        }
                    } else {
                        failure = Some((err, frames));
                    }
                }
            }
        }

        if let Some((err, frames)) = failure {
            warn!(
                "Channel {} batch {} failed after {} attempts, {} points stale: {}",
                self.channel.id,
                batch.index,
                made,
                batch.points.len(),
                err
            );
            let mut record = LogRecord::read(self.channel.id, batch)
                .with_error(&err)
                .with_attempts(made)
                .with_latency(started.elapsed());
            if let Some((req, resp)) = &frames {
                record = record.with_payloads(req, resp);
            }
            self.logger.log(record);
        }
        None
    }
}
