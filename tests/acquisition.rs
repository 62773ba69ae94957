//! End-to-end acquisition scenarios: planning, polling, stale-on-failure,
//! commands and the message log, against a loopback Modbus TCP server and
//! scripted in-process transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use voltage_acquisition::{
    BatchPlanner, Channel, ChannelHandle, ChannelPoller, ChannelRegistry, ChannelState,
    CommandExecutor, CommandRequest, CommandStatus, CommandStatusBoard, DataPublisher, DataType,
    DeviceLimits, Engine, EngineSettings, FourRemote, LogWriter, MemoryTelemetryStore,
    MessageLogger, ModbusError, ModbusResult, ModbusTransport, Point, ReadBatch, RetryPolicy,
    TelemetryStore, TransportConfig, TransportStats,
};

const CHANNEL: u16 = 1001;

/// 50 contiguous UInt16 holding registers at 0..50, ids 1..=50.
fn telemetry_points() -> Vec<Point> {
    (0..50u16)
        .map(|addr| Point::new(u32::from(addr) + 1, 1, addr, DataType::UInt16))
        .collect()
}

fn pcs_channel(port: u16) -> Channel {
    let mut points = telemetry_points();
    points.push(Point::new(100, 1, 60, DataType::UInt16).with_category(FourRemote::Adjustment));
    Channel::new(CHANNEL, "pcs-1001", TransportConfig::tcp("127.0.0.1", port))
        .with_polling_interval(Duration::from_millis(50))
        .with_request_timeout(Duration::from_millis(500))
        .with_limits(DeviceLimits::new().with_max_read_registers(20))
        .with_points(points)
}

// ============================================================================
// Loopback Modbus TCP server
// ============================================================================

/// Requests seen by the server: (function code, address, quantity or value).
type Seen = Arc<StdMutex<Vec<(u8, u16, u16)>>>;

/// Answers FC03/04 with `register[a] = a`, echoes FC05/06/16.
async fn spawn_server() -> (u16, Seen, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen: Seen = Arc::default();
    let accepted = Arc::clone(&seen);

    let task = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let seen = Arc::clone(&accepted);
            tokio::spawn(async move {
                let mut head = [0u8; 7];
                while socket.read_exact(&mut head).await.is_ok() {
                    let len = u16::from_be_bytes([head[4], head[5]]) as usize;
                    let mut pdu = vec![0u8; len - 1];
                    if socket.read_exact(&mut pdu).await.is_err() {
                        return;
                    }
                    let fc = pdu[0];
                    let address = u16::from_be_bytes([pdu[1], pdu[2]]);
                    let operand = u16::from_be_bytes([pdu[3], pdu[4]]);
                    seen.lock().unwrap().push((fc, address, operand));

                    let body = match fc {
                        0x03 | 0x04 => {
                            let mut body = vec![fc, (operand * 2) as u8];
                            for reg in address..address + operand {
                                body.extend_from_slice(&reg.to_be_bytes());
                            }
                            body
                        }
                        0x05 | 0x06 | 0x10 => pdu[..5].to_vec(),
                        _ => vec![fc | 0x80, 0x01],
                    };

                    let mut frame = head[..4].to_vec();
                    frame.extend_from_slice(&((body.len() + 1) as u16).to_be_bytes());
                    frame.push(head[6]);
                    frame.extend_from_slice(&body);
                    if socket.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (port, seen, task)
}

fn engine_settings(dir: &std::path::Path) -> EngineSettings {
    EngineSettings {
        log_dir: dir.to_path_buf(),
        ..EngineSettings::default()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::test]
async fn test_engine_polls_fifty_points_in_three_batches() {
    let (port, seen, server) = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryTelemetryStore::new());
    let before = now_ms();

    let mut engine = Engine::start(engine_settings(dir.path()), Arc::clone(&store));
    let report = engine.reload(vec![pcs_channel(port)]).await;
    assert_eq!(report.started, vec![CHANNEL]);

    let mut reports = engine.channel_reports(CHANNEL).unwrap();
    let first = timeout(Duration::from_secs(5), reports.wait_for(|r| r.is_some()))
        .await
        .expect("no cycle completed")
        .unwrap()
        .clone()
        .unwrap();

    // The adjustment point at 60 is its own batch after the three telemetry ones
    let status = engine.channel_status(CHANNEL).await.unwrap();
    assert_eq!(status.batches, 4);
    assert_eq!(first.batches_failed, 0);
    assert_eq!(
        *engine.channel_state(CHANNEL).unwrap().borrow(),
        ChannelState::Polling
    );

    let reads: Vec<(u8, u16, u16)> = seen.lock().unwrap().iter().take(4).copied().collect();
    assert_eq!(
        reads,
        vec![(0x03, 0, 20), (0x03, 20, 20), (0x03, 40, 10), (0x03, 60, 1)]
    );

    let telemetry = store.snapshot(CHANNEL, FourRemote::Telemetry);
    assert_eq!(telemetry.len(), 50);
    for (id, value) in &telemetry {
        assert_eq!(value.value, f64::from(*id - 1));
        assert!(value.timestamp_ms >= before);
    }

    engine.shutdown().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn test_engine_commands_unknown_target_and_acknowledged_write() {
    let (port, seen, server) = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryTelemetryStore::new());

    let mut engine = Engine::start(engine_settings(dir.path()), Arc::clone(&store));
    engine.reload(vec![pcs_channel(port)]).await;
    let board = Arc::clone(engine.status_board());

    engine
        .submit(CommandRequest::new(9999, 10, 1.0, "cmd-unknown"))
        .await
        .unwrap();
    let outcome = timeout(Duration::from_secs(5), board.wait_for("cmd-unknown"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, CommandStatus::Failed);
    assert_eq!(outcome.correlation_id, "cmd-unknown");
    assert!(outcome.message.unwrap().contains("9999"));
    assert!(seen.lock().unwrap().iter().all(|(fc, _, _)| *fc == 0x03));

    engine
        .submit(CommandRequest::new(CHANNEL, 100, 1234.0, "cmd-setpoint"))
        .await
        .unwrap();
    let outcome = timeout(Duration::from_secs(5), board.wait_for("cmd-setpoint"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, CommandStatus::Acknowledged);
    assert!(seen.lock().unwrap().contains(&(0x06, 60, 1234)));
    assert_eq!(
        store.get(CHANNEL, FourRemote::Adjustment, 100).map(|v| v.value),
        Some(1234.0)
    );

    engine.shutdown().await.unwrap();
    server.abort();
}

// ============================================================================
// Scripted transport
// ============================================================================

/// Answers `register[a] = a`, fails listed batches with a timeout, and
/// records every exchange as a start/end pair.
#[derive(Default)]
struct ScriptedTransport {
    failing_batches: Vec<usize>,
    fail_all: bool,
    exchange_time: Duration,
    attempts: HashMap<usize, u32>,
    events: Vec<&'static str>,
    busy: Arc<AtomicBool>,
}

impl ScriptedTransport {
    async fn exchange(&mut self, kind: &'static str) {
        assert!(
            !self.busy.swap(true, Ordering::SeqCst),
            "overlapping exchange"
        );
        self.events.push(kind);
        if !self.exchange_time.is_zero() {
            sleep(self.exchange_time).await;
        }
        self.events.push("end");
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl ModbusTransport for ScriptedTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        Ok(())
    }

    async fn execute_read(&mut self, batch: &ReadBatch) -> ModbusResult<Vec<u16>> {
        *self.attempts.entry(batch.index).or_default() += 1;
        self.exchange("read").await;
        if self.fail_all || self.failing_batches.contains(&batch.index) {
            return Err(ModbusError::timeout("scripted read", 100));
        }
        Ok((batch.start..batch.start + batch.quantity).collect())
    }

    async fn execute_write(&mut self, _point: &Point, _words: &[u16]) -> ModbusResult<()> {
        self.exchange("write").await;
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

struct Rig {
    poller: ChannelPoller<ScriptedTransport, MemoryTelemetryStore>,
    channel: Arc<Channel>,
    transport: Arc<Mutex<ScriptedTransport>>,
    store: Arc<MemoryTelemetryStore>,
    cancel: CancellationToken,
}

fn rig(channel: Channel, transport: ScriptedTransport, logger: MessageLogger) -> Rig {
    let plan = BatchPlanner::new(channel.limits)
        .plan(channel.id, channel.points())
        .unwrap();
    // The receiver keeps the last plan after the sender is gone
    let plan_rx = watch::channel(Arc::new(plan)).1;

    let channel = Arc::new(channel);
    let transport = Arc::new(Mutex::new(transport));
    let store = Arc::new(MemoryTelemetryStore::new());
    let cancel = CancellationToken::new();
    let poller = ChannelPoller::new(
        Arc::clone(&channel),
        Arc::clone(&transport),
        plan_rx,
        DataPublisher::new(Arc::clone(&store)),
        logger,
        cancel.clone(),
    );
    Rig {
        poller,
        channel,
        transport,
        store,
        cancel,
    }
}

fn scripted_channel() -> Channel {
    Channel::new(CHANNEL, "pcs-1001", TransportConfig::tcp("127.0.0.1", 502))
        .with_polling_interval(Duration::from_secs(1))
        .with_limits(DeviceLimits::new().with_max_read_registers(20))
        .with_points(telemetry_points())
}

#[tokio::test]
async fn test_failed_batch_leaves_its_points_stale() {
    let dir = tempfile::tempdir().unwrap();
    let policies = Arc::new(RwLock::new(HashMap::new()));
    let (logger, log_rx) = MessageLogger::new(64);
    let writer = LogWriter::new(dir.path(), policies).spawn(log_rx);

    let transport = ScriptedTransport {
        failing_batches: vec![1],
        ..ScriptedTransport::default()
    };
    let mut rig = rig(scripted_channel(), transport, logger);

    let stale: Vec<(u32, f64)> = (1..=50).map(|id| (id, -1.0)).collect();
    rig.store
        .write_category(CHANNEL, FourRemote::Telemetry, &stale, 1);

    let report = rig.poller.poll_cycle().await;
    assert_eq!(report.batches_ok, 2);
    assert_eq!(report.batches_failed, 1);
    assert_eq!(report.points_updated, 30);
    assert_eq!(*rig.poller.state().borrow(), ChannelState::Polling);

    let attempts = rig.transport.lock().await.attempts.clone();
    assert_eq!(attempts, HashMap::from([(0, 1), (1, 3), (2, 1)]));

    let telemetry = rig.store.snapshot(CHANNEL, FourRemote::Telemetry);
    for (id, value) in telemetry {
        if (21..=40).contains(&id) {
            assert_eq!(value.timestamp_ms, 1, "point {} should be stale", id);
            assert_eq!(value.value, -1.0);
        } else {
            assert!(value.timestamp_ms > 1, "point {} should be fresh", id);
            assert_eq!(value.value, f64::from(id - 1));
        }
    }

    drop(rig);
    writer.await.unwrap();

    let channel_dir = dir.path().join(CHANNEL.to_string());
    let files: Vec<_> = std::fs::read_dir(&channel_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    let log = std::fs::read_to_string(&files[0]).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3);

    let failures: Vec<&&str> = lines
        .iter()
        .filter(|l| !l.contains("outcome=ok"))
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("batch=1"));
    assert!(failures[0].contains("outcome=timeout"));
    assert!(failures[0].contains("attempts=3"));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_stretches_and_resets_interval() {
    let channel = scripted_channel().with_retry(RetryPolicy {
        attempts: 1,
        backoff_multiplier: 2.0,
        backoff_cap: Duration::from_secs(8),
        ..RetryPolicy::default()
    });
    let transport = ScriptedTransport {
        fail_all: true,
        ..ScriptedTransport::default()
    };
    let rig = rig(channel, transport, MessageLogger::disabled());
    let mut reports = rig.poller.reports();
    let state = rig.poller.state();
    let handle = tokio::spawn(rig.poller.run());

    let mut arrivals = Vec::new();
    for _ in 0..5 {
        reports.changed().await.unwrap();
        arrivals.push(Instant::now());
    }
    assert_eq!(*state.borrow(), ChannelState::Backoff);

    let gaps: Vec<Duration> = arrivals.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(8),
        ]
    );

    rig.transport.lock().await.fail_all = false;
    reports.changed().await.unwrap();
    let recovered = reports.borrow_and_update().clone().unwrap();
    assert_eq!(recovered.batches_failed, 0);
    assert_eq!(recovered.next_interval, rig.channel.polling_interval);
    assert_eq!(*state.borrow(), ChannelState::Polling);

    rig.cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_commands_never_overlap_batch_reads() {
    let mut points = telemetry_points();
    points.push(Point::new(100, 1, 60, DataType::UInt16).with_category(FourRemote::Adjustment));
    let channel = scripted_channel()
        .with_polling_interval(Duration::from_millis(100))
        .with_points(points);
    let transport = ScriptedTransport {
        exchange_time: Duration::from_millis(7),
        ..ScriptedTransport::default()
    };
    let rig = rig(channel, transport, MessageLogger::disabled());

    let registry: ChannelRegistry<ScriptedTransport> = Arc::new(RwLock::new(HashMap::from([(
        CHANNEL,
        ChannelHandle {
            channel: Arc::clone(&rig.channel),
            transport: Arc::clone(&rig.transport),
            state: rig.poller.state(),
        },
    )])));
    let board = Arc::new(CommandStatusBoard::new());
    let executor = CommandExecutor::new(
        registry,
        Arc::clone(&board),
        DataPublisher::new(Arc::clone(&rig.store)),
        MessageLogger::disabled(),
    );

    let poller = tokio::spawn(rig.poller.run());
    let mut outcomes = Vec::new();
    for i in 0..20u32 {
        sleep(Duration::from_millis(13)).await;
        let request = CommandRequest::new(CHANNEL, 100, f64::from(i), format!("c-{}", i));
        outcomes.push(executor.execute(&request).await.status);
    }
    rig.cancel.cancel();
    poller.await.unwrap();

    assert!(outcomes.iter().all(|s| *s == CommandStatus::Acknowledged));

    let transport = rig.transport.lock().await;
    let events = &transport.events;
    assert!(events.iter().filter(|e| **e == "write").count() == 20);
    assert!(events.iter().filter(|e| **e == "read").count() >= 8);
    for pair in events.chunks(2) {
        assert_ne!(pair[0], "end");
        assert_eq!(pair[1], "end");
    }
    // At least one write landed between two reads of the same cycle
    assert!(events
        .chunks(2)
        .map(|p| p[0])
        .collect::<Vec<_>>()
        .windows(3)
        .any(|w| w == ["read", "write", "read"]));
}
