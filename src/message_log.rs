//! # Message Logger
//!
//! Per-channel, per-UTC-day record of every request/response exchange.
//!
//! ```text
//! {root}/{channel_id}/{YYYYMMDD}_ch{channel_id}.log      first segment of the day
//! {root}/{channel_id}/{YYYYMMDD}_ch{channel_id}.{n}.log  after n size rotations
//! {root}/{channel_id}/....log.gz                         compressed closed segments
//! ```
//!
//! Producers call [`MessageLogger::log`], which never blocks: records go
//! into a bounded queue and are dropped (and counted) when it is full. A
//! single blocking writer thread drains the queue into the files. Sink
//! errors are reported through `tracing` and cost only the record.
//!
//! One record per line, `key=value` fields, so segments stay greppable:
//!
//! ```text
//! 2026-10-14T08:00:00.120Z ch=1001 op=read batch=1 slave=1 fc=0x03 addr=20 qty=20 outcome=timeout attempts=3 latency_ms=1002 error="Timeout after 1000ms: transaction 17 to 10.0.0.5:502"
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ModbusError;
use crate::model::{LogLevel, LogPolicy, Point};
use crate::planner::ReadBatch;

/// Log policy per channel id, shared between the engine and the writer.
pub type LogPolicies = Arc<RwLock<HashMap<u16, LogPolicy>>>;

/// Segment each channel's writer currently holds open. Retention leaves
/// these alone.
pub type ActiveSegments = Arc<RwLock<HashMap<u16, PathBuf>>>;

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Connect,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Connect => "connect",
        }
    }
}

/// What the exchange was about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Batch(usize),
    Point(u32),
    Channel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok,
    Failed { kind: &'static str, message: String },
}

/// One transport exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub channel_id: u16,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub target: Target,
    pub slave_id: u8,
    pub function_code: u8,
    pub address: u16,
    pub quantity: u16,
    pub outcome: Outcome,
    pub attempts: u32,
    pub latency: Duration,
    pub correlation_id: Option<String>,
    pub request: Option<Vec<u8>>,
    pub response: Option<Vec<u8>>,
}

impl LogRecord {
    fn base(channel_id: u16, operation: Operation, target: Target) -> Self {
        Self {
            channel_id,
            timestamp: Utc::now(),
            operation,
            target,
            slave_id: 0,
            function_code: 0,
            address: 0,
            quantity: 0,
            outcome: Outcome::Ok,
            attempts: 1,
            latency: Duration::ZERO,
            correlation_id: None,
            request: None,
            response: None,
        }
    }

    pub fn read(channel_id: u16, batch: &ReadBatch) -> Self {
        Self {
            slave_id: batch.slave_id,
            function_code: batch.function_code,
            address: batch.start,
            quantity: batch.quantity,
            ..Self::base(channel_id, Operation::Read, Target::Batch(batch.index))
        }
    }

    pub fn write(channel_id: u16, point: &Point, correlation_id: &str) -> Self {
        Self {
            slave_id: point.slave_id,
            function_code: point.write_function().unwrap_or(point.function_code),
            address: point.address,
            quantity: point.width(),
            correlation_id: Some(correlation_id.to_string()),
            ..Self::base(channel_id, Operation::Write, Target::Point(point.id))
        }
    }

    pub fn connect(channel_id: u16) -> Self {
        Self::base(channel_id, Operation::Connect, Target::Channel)
    }

    pub fn with_error(mut self, err: &ModbusError) -> Self {
        self.outcome = Outcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
        };
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_payloads(mut self, request: &[u8], response: &[u8]) -> Self {
        self.request = Some(request.to_vec());
        self.response = Some(response.to_vec());
        self
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok)
    }

    /// Render as one line, newline included. Payloads only at `debug`.
    pub fn format_line(&self, level: LogLevel) -> String {
        let mut line = String::with_capacity(160);
        let _ = write!(
            line,
            "{} ch={} op={}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.channel_id,
            self.operation.as_str()
        );
        match self.target {
            Target::Batch(index) => {
                let _ = write!(line, " batch={}", index);
            }
            Target::Point(id) => {
                let _ = write!(line, " point={}", id);
            }
            Target::Channel => {}
        }
        if let Some(id) = &self.correlation_id {
            let _ = write!(line, " corr={}", id);
        }
        if self.operation != Operation::Connect {
            let _ = write!(
                line,
                " slave={} fc=0x{:02X} addr={} qty={}",
                self.slave_id, self.function_code, self.address, self.quantity
            );
        }
        let outcome = match &self.outcome {
            Outcome::Ok => "ok",
            Outcome::Failed { kind, .. } => *kind,
        };
        let _ = write!(
            line,
            " outcome={} attempts={} latency_ms={}",
            outcome,
            self.attempts,
            self.latency.as_millis()
        );
        if let Outcome::Failed { message, .. } = &self.outcome {
            let _ = write!(line, " error=\"{}\"", message.replace('"', "'"));
        }
        if level == LogLevel::Debug {
            if let Some(req) = &self.request {
                let _ = write!(line, " req={}", hex::encode_upper(req));
            }
            if let Some(resp) = &self.response {
                let _ = write!(line, " resp={}", hex::encode_upper(resp));
            }
        }
        line.push('\n');
        line
    }
}

// ============================================================================
// Producer handle
// ============================================================================

/// Cloneable, non-blocking handle used by pollers and the command executor.
#[derive(Debug, Clone)]
pub struct MessageLogger {
    tx: mpsc::Sender<LogRecord>,
    dropped: Arc<AtomicU64>,
}

impl MessageLogger {
    /// Create a logger and the receiving end of its queue.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LogRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A logger whose records all go nowhere.
    pub fn disabled() -> Self {
        Self::new(1).0
    }

    pub fn log(&self, record: LogRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(
                        "Message log queue full, dropped record for channel {} ({} dropped so far)",
                        record.channel_id, dropped
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Writer
// ============================================================================

/// File name of segment `seq` of a channel's day.
pub fn segment_file_name(day: NaiveDate, channel_id: u16, seq: u32) -> String {
    if seq == 0 {
        format!("{}_ch{}.log", day.format("%Y%m%d"), channel_id)
    } else {
        format!("{}_ch{}.{}.log", day.format("%Y%m%d"), channel_id, seq)
    }
}

struct Segment {
    day: NaiveDate,
    seq: u32,
    path: PathBuf,
    file: File,
    size: u64,
}

impl Segment {
    fn open(dir: &Path, channel_id: u16, day: NaiveDate, seq: u32) -> io::Result<Self> {
        let path = dir.join(segment_file_name(day, channel_id, seq));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            day,
            seq,
            path,
            file,
            size,
        })
    }

    /// Open the newest existing segment of `day`, or the first one.
    fn open_latest(dir: &Path, channel_id: u16, day: NaiveDate) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut seq = 0;
        while dir
            .join(segment_file_name(day, channel_id, seq + 1))
            .exists()
        {
            seq += 1;
        }
        Self::open(dir, channel_id, day, seq)
    }
}

/// Drains the record queue into segment files on a blocking thread.
pub struct LogWriter {
    root: PathBuf,
    policies: LogPolicies,
    segments: HashMap<u16, Segment>,
    active: ActiveSegments,
}

impl LogWriter {
    pub fn new(root: impl Into<PathBuf>, policies: LogPolicies) -> Self {
        Self {
            root: root.into(),
            policies,
            segments: HashMap::new(),
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Shared view of the open segments, for [`spawn_retention_task`].
    pub fn active_segments(&self) -> ActiveSegments {
        Arc::clone(&self.active)
    }

    /// Run until every [`MessageLogger`] clone is dropped.
    pub fn spawn(self, rx: mpsc::Receiver<LogRecord>) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run(rx))
    }

    fn run(mut self, mut rx: mpsc::Receiver<LogRecord>) {
        while let Some(record) = rx.blocking_recv() {
            if let Err(e) = self.append(&record) {
                warn!(
                    "Message log write failed for channel {}: {}",
                    record.channel_id, e
                );
                self.segments.remove(&record.channel_id);
                self.active.write().remove(&record.channel_id);
            }
        }
        debug!("Message log writer stopped");
    }

    pub fn append(&mut self, record: &LogRecord) -> io::Result<()> {
        let channel_id = record.channel_id;
        let policy = self
            .policies
            .read()
            .get(&channel_id)
            .copied()
            .unwrap_or_default();
        let line = record.format_line(policy.level);
        let day = record.timestamp.date_naive();
        let dir = self.root.join(channel_id.to_string());

        let segment = match self.segments.entry(channel_id) {
            Entry::Occupied(entry) if entry.get().day == day => entry.into_mut(),
            Entry::Occupied(mut entry) => {
                entry.insert(Segment::open_latest(&dir, channel_id, day)?);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(Segment::open_latest(&dir, channel_id, day)?),
        };

        let len = line.len() as u64;
        if segment.size > 0 && segment.size + len > policy.max_segment_bytes {
            *segment = Segment::open(&dir, channel_id, day, segment.seq + 1)?;
            debug!(
                "Channel {} log rotated to segment {}",
                channel_id, segment.seq
            );
        }

        let mut active = self.active.write();
        if active.get(&channel_id) != Some(&segment.path) {
            active.insert(channel_id, segment.path.clone());
        }
        drop(active);

        segment.file.write_all(line.as_bytes())?;
        segment.size += len;
        Ok(())
    }
}

// ============================================================================
// Retention
// ============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub compressed: usize,
}

/// Day and compression state of a segment file belonging to `channel_id`.
fn parse_segment_name(name: &str, channel_id: u16) -> Option<(NaiveDate, bool)> {
    let (name, gz) = match name.strip_suffix(".gz") {
        Some(stem) => (stem, true),
        None => (name, false),
    };
    let stem = name.strip_suffix(".log")?;
    let (date, rest) = stem.split_at_checked(8)?;
    let day = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;

    let rest = rest.strip_prefix(&format!("_ch{}", channel_id))?;
    match rest.strip_prefix('.') {
        None if rest.is_empty() => Some((day, gz)),
        Some(seq) if !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit()) => {
            Some((day, gz))
        }
        _ => None,
    }
}

fn compress_file(path: &Path) -> io::Result<()> {
    let mut input = File::open(path)?;
    // A segment reopened after compression becomes a second gzip member
    let output_path = PathBuf::from(format!("{}.gz", path.display()));
    let output = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&output_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path)
}

/// Delete segments older than the retention window and compress closed
/// segments past the compress-after threshold. Age is taken from the day
/// in the file name. `active` is the segment the writer holds open.
pub fn sweep_retention(
    root: &Path,
    channel_id: u16,
    policy: &LogPolicy,
    today: NaiveDate,
    active: Option<&Path>,
) -> io::Result<SweepReport> {
    let dir = root.join(channel_id.to_string());
    let mut report = SweepReport::default();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((day, gz)) = parse_segment_name(name, channel_id) else {
            continue;
        };
        if active == Some(path.as_path()) {
            continue;
        }

        let age_days = (today - day).num_days();
        if age_days > i64::from(policy.retention_days) {
            fs::remove_file(&path)?;
            report.deleted += 1;
            debug!("Deleted expired log segment {}", path.display());
            continue;
        }

        let compress = !gz
            && day < today
            && policy
                .compress_after_days
                .is_some_and(|after| age_days >= i64::from(after));
        if compress {
            compress_file(&path)?;
            report.compressed += 1;
            debug!("Compressed log segment {}", path.display());
        }
    }
    Ok(report)
}

/// Periodically sweep every channel with a known policy.
pub fn spawn_retention_task(
    root: PathBuf,
    policies: LogPolicies,
    active: ActiveSegments,
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

            let snapshot: Vec<(u16, LogPolicy)> =
                policies.read().iter().map(|(id, p)| (*id, *p)).collect();
            let active = Arc::clone(&active);
            let root = root.clone();
            let today = Utc::now().date_naive();
            let sweep = tokio::task::spawn_blocking(move || {
                for (channel_id, policy) in snapshot {
                    let open = active.read().get(&channel_id).cloned();
                    match sweep_retention(&root, channel_id, &policy, today, open.as_deref()) {
                        Ok(r) if r.deleted + r.compressed > 0 => info!(
                            "Channel {} log retention: {} deleted, {} compressed",
                            channel_id, r.deleted, r.compressed
                        ),
                        Ok(_) => {}
                        Err(e) => warn!("Channel {} log retention failed: {}", channel_id, e),
                    }
                }
            })
            .await;
            if let Err(e) = sweep {
                warn!("Log retention sweep aborted: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use chrono::TimeZone;

    fn batch() -> ReadBatch {
        ReadBatch {
            index: 1,
            slave_id: 1,
            function_code: 0x03,
            start: 20,
            quantity: 20,
            points: vec![Point::new(1, 1, 20, DataType::UInt16)],
        }
    }

    fn policies(channel_id: u16, policy: LogPolicy) -> LogPolicies {
        Arc::new(RwLock::new(HashMap::from([(channel_id, policy)])))
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_format_line_info_and_debug() {
        let mut record = LogRecord::read(1001, &batch())
            .with_error(&ModbusError::timeout("transaction 3", 1000))
            .with_attempts(3)
            .with_latency(Duration::from_millis(1002))
            .with_payloads(&[0x00, 0x03], &[]);
        record.timestamp = at(2026, 10, 14);

        let info = record.format_line(LogLevel::Info);
        assert_eq!(
            info,
            "2026-10-14T08:00:00.000Z ch=1001 op=read batch=1 slave=1 fc=0x03 addr=20 qty=20 \
             outcome=timeout attempts=3 latency_ms=1002 error=\"Timeout after 1000ms: transaction 3\"\n"
        );
        let debug = record.format_line(LogLevel::Debug);
        assert!(debug.ends_with(" req=0003 resp=\n"));
    }

    #[test]
    fn test_logger_drops_when_full() {
        let (logger, mut rx) = MessageLogger::new(2);
        for _ in 0..5 {
            logger.log(LogRecord::connect(1));
        }
        assert_eq!(logger.dropped(), 3);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_writer_segments_by_day_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let policy = LogPolicy {
            max_segment_bytes: 200,
            ..LogPolicy::default()
        };
        let mut writer = LogWriter::new(dir.path(), policies(7, policy));

        for _ in 0..3 {
            let mut record = LogRecord::read(7, &batch());
            record.timestamp = at(2026, 10, 13);
            writer.append(&record).unwrap();
        }
        let mut next_day = LogRecord::connect(7);
        next_day.timestamp = at(2026, 10, 14);
        writer.append(&next_day).unwrap();

        let channel_dir = dir.path().join("7");
        assert!(channel_dir.join("20261013_ch7.log").exists());
        assert!(channel_dir.join("20261013_ch7.1.log").exists());
        assert!(channel_dir.join("20261014_ch7.log").exists());

        let first = fs::read_to_string(channel_dir.join("20261013_ch7.log")).unwrap();
        assert!(first.len() as u64 <= 200);
        assert!(first.contains("op=read batch=1"));
    }

    #[test]
    fn test_writer_resumes_latest_segment() {
        let dir = tempfile::tempdir().unwrap();
        let channel_dir = dir.path().join("3");
        fs::create_dir_all(&channel_dir).unwrap();
        fs::write(channel_dir.join("20261014_ch3.log"), "x\n").unwrap();
        fs::write(channel_dir.join("20261014_ch3.1.log"), "y\n").unwrap();

        let mut writer = LogWriter::new(dir.path(), policies(3, LogPolicy::default()));
        let mut record = LogRecord::connect(3);
        record.timestamp = at(2026, 10, 14);
        writer.append(&record).unwrap();

        let resumed = fs::read_to_string(channel_dir.join("20261014_ch3.1.log")).unwrap();
        assert!(resumed.starts_with("y\n"));
        assert!(resumed.contains("op=connect"));
    }

    #[test]
    fn test_parse_segment_name() {
        let day = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        assert_eq!(parse_segment_name("20261014_ch5.log", 5), Some((day, false)));
        assert_eq!(parse_segment_name("20261014_ch5.2.log.gz", 5), Some((day, true)));
        assert_eq!(parse_segment_name("20261014_ch55.log", 5), None);
        assert_eq!(parse_segment_name("notes.txt", 5), None);
    }

    #[test]
    fn test_sweep_deletes_and_compresses() {
        let dir = tempfile::tempdir().unwrap();
        let channel_dir = dir.path().join("9");
        fs::create_dir_all(&channel_dir).unwrap();
        for name in [
            "20260901_ch9.log",
            "20261012_ch9.log",
            "20261012_ch9.1.log",
            "20261014_ch9.log",
            "unrelated.log",
        ] {
            fs::write(channel_dir.join(name), "line\n").unwrap();
        }

        let policy = LogPolicy {
            retention_days: 30,
            compress_after_days: Some(1),
            ..LogPolicy::default()
        };
        let today = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        let report = sweep_retention(dir.path(), 9, &policy, today, None).unwrap();

        assert_eq!(
            report,
            SweepReport {
                deleted: 1,
                compressed: 2
            }
        );
        assert!(!channel_dir.join("20260901_ch9.log").exists());
        assert!(channel_dir.join("20261012_ch9.log.gz").exists());
        assert!(channel_dir.join("20261012_ch9.1.log.gz").exists());
        assert!(channel_dir.join("20261014_ch9.log").exists());
        assert!(channel_dir.join("unrelated.log").exists());
    }

    #[test]
    fn test_sweep_skips_segment_held_by_writer() {
        let dir = tempfile::tempdir().unwrap();
        let policy = LogPolicy {
            compress_after_days: Some(1),
            ..LogPolicy::default()
        };
        let mut writer = LogWriter::new(dir.path(), policies(4, policy));
        let active = writer.active_segments();

        let mut late = LogRecord::connect(4);
        late.timestamp = at(2026, 10, 13);
        writer.append(&late).unwrap();

        let held = dir.path().join("4").join("20261013_ch4.log");
        assert_eq!(active.read().get(&4), Some(&held));

        let today = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        let report = sweep_retention(dir.path(), 4, &policy, today, Some(&held)).unwrap();
        assert_eq!(report, SweepReport::default());

        writer.append(&late).unwrap();
        let lines = fs::read_to_string(&held).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[test]
    fn test_compress_appends_to_existing_archive() {
        use flate2::read::MultiGzDecoder;
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let segment = dir.path().join("20261012_ch9.log");
        fs::write(&segment, "first\n").unwrap();
        compress_file(&segment).unwrap();
        fs::write(&segment, "second\n").unwrap();
        compress_file(&segment).unwrap();

        let archive = File::open(dir.path().join("20261012_ch9.log.gz")).unwrap();
        let mut text = String::new();
        MultiGzDecoder::new(archive).read_to_string(&mut text).unwrap();
        assert_eq!(text, "first\nsecond\n");
        assert!(!segment.exists());
    }
}
