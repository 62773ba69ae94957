//! Data publisher and the shared telemetry store
//!
//! Layout: `(channel, category) → point id → (value, timestamp_ms)`.
//! A cycle is applied with one write per category, under that category's
//! lock, so readers never see half a cycle. Points of failed batches are
//! simply left alone: staleness shows up as an unchanged timestamp.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::model::FourRemote;
use crate::planner::DecodedValue;

/// Latest known value of a point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointValue {
    pub value: f64,
    /// UTC milliseconds since the epoch
    pub timestamp_ms: i64,
}

/// Destination for published values, shared by all channels.
pub trait TelemetryStore: Send + Sync + 'static {
    /// Replace the given points of one category in a single write.
    fn write_category(
        &self,
        channel_id: u16,
        category: FourRemote,
        values: &[(u32, f64)],
        timestamp_ms: i64,
    );

    fn get(&self, channel_id: u16, category: FourRemote, point_id: u32) -> Option<PointValue>;

    /// Copy of one category.
    fn snapshot(&self, channel_id: u16, category: FourRemote) -> HashMap<u32, PointValue>;

    /// Forget everything stored for a channel.
    fn remove_channel(&self, channel_id: u16);
}

type CategoryMap = Arc<RwLock<HashMap<u32, PointValue>>>;

/// In-process store: concurrent map of per-category locked hash maps.
#[derive(Debug, Default)]
pub struct MemoryTelemetryStore {
    categories: DashMap<(u16, FourRemote), CategoryMap>,
}

impl MemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn category(&self, channel_id: u16, category: FourRemote) -> CategoryMap {
        self.categories
            .entry((channel_id, category))
            .or_default()
            .clone()
    }
}

impl TelemetryStore for MemoryTelemetryStore {
    fn write_category(
        &self,
        channel_id: u16,
        category: FourRemote,
        values: &[(u32, f64)],
        timestamp_ms: i64,
    ) {
        let map = self.category(channel_id, category);
        let mut guard = map.write();
        for &(point_id, value) in values {
            guard.insert(
                point_id,
                PointValue {
                    value,
                    timestamp_ms,
                },
            );
        }
    }

    fn get(&self, channel_id: u16, category: FourRemote, point_id: u32) -> Option<PointValue> {
        let map = self.categories.get(&(channel_id, category))?.clone();
        let value = map.read().get(&point_id).copied();
        value
    }

    fn snapshot(&self, channel_id: u16, category: FourRemote) -> HashMap<u32, PointValue> {
        match self.categories.get(&(channel_id, category)) {
            Some(entry) => {
                let map = entry.clone();
                drop(entry);
                let copy = map.read().clone();
                copy
            }
            None => HashMap::new(),
        }
    }

    fn remove_channel(&self, channel_id: u16) {
        self.categories.retain(|(channel, _), _| *channel != channel_id);
    }
}

/// Applies poll cycles and write acknowledgements to a [`TelemetryStore`].
pub struct DataPublisher<S: TelemetryStore> {
    store: Arc<S>,
}

impl<S: TelemetryStore> Clone for DataPublisher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: TelemetryStore> DataPublisher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Publish one cycle's decoded values; returns the number of points written.
    pub fn publish_cycle(&self, channel_id: u16, values: &[DecodedValue]) -> usize {
        if values.is_empty() {
            return 0;
        }
        let timestamp_ms = now_ms();

        let mut grouped: HashMap<FourRemote, Vec<(u32, f64)>> = HashMap::with_capacity(4);
        for v in values {
            grouped
                .entry(v.category)
                .or_default()
                .push((v.point_id, v.value));
        }
        for category in FourRemote::ALL {
            if let Some(points) = grouped.get(&category) {
                self.store
                    .write_category(channel_id, category, points, timestamp_ms);
            }
        }

        debug!(
            "Published {} values for channel {} at {}",
            values.len(),
            channel_id,
            timestamp_ms
        );
        values.len()
    }

    /// Record the value an acknowledged write put on the device.
    pub fn publish_ack(&self, channel_id: u16, category: FourRemote, point_id: u32, value: f64) {
        self.store
            .write_category(channel_id, category, &[(point_id, value)], now_ms());
    }
}

#[inline]
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
