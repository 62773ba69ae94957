//! # Batch Planner
//!
//! Turns a channel's point list into the fixed, ordered list of read
//! requests the poller executes every cycle.
//!
//! ## How It Works
//!
//! Points are sorted by `(slave, function code, address, point id)`. A batch
//! is extended greedily while both hold:
//!
//! - the hole between the batch end and the next point is at most `max_gap`
//!   unused units
//! - the merged span stays within [`DeviceLimits::read_limit`]
//!
//! Otherwise a new batch starts. Points that overlap (several `bool` bits
//! of one register) always share a batch. The result is deterministic for
//! a given input, whatever order the points arrive in.
//!
//! ## Example
//!
//! ```rust
//! use voltage_acquisition::{BatchPlanner, DataType, DeviceLimits, Point};
//!
//! let points: Vec<Point> = (0..50)
//!     .map(|i| Point::new(i, 1, i as u16, DataType::UInt16))
//!     .collect();
//! let planner = BatchPlanner::new(DeviceLimits::new().with_max_read_registers(20));
//! let plan = planner.plan(1001, &points).unwrap();
//!
//! let sizes: Vec<u16> = plan.batches().iter().map(|b| b.quantity).collect();
//! assert_eq!(sizes, vec![20, 20, 10]);
//! ```

use crate::device_limits::DeviceLimits;
use crate::error::{ConfigError, ConfigResult, ModbusError, ModbusResult};
use crate::model::{FourRemote, Point};

/// One decoded point value from a batch response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedValue {
    pub point_id: u32,
    pub category: FourRemote,
    pub value: f64,
}

/// Points read with a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBatch {
    /// Position in the channel's plan
    pub index: usize,
    pub slave_id: u8,
    pub function_code: u8,
    pub start: u16,
    /// Span in registers, or bits for FC01/02
    pub quantity: u16,
    pub points: Vec<Point>,
}

impl ReadBatch {
    /// Decode every point out of the response words.
    ///
    /// Any point failing to decode fails the whole batch.
    pub fn decode(&self, words: &[u16]) -> ModbusResult<Vec<DecodedValue>> {
        if words.len() != self.quantity as usize {
            return Err(ModbusError::invalid_data(format!(
                "Batch {} expected {} words, got {}",
                self.index,
                self.quantity,
                words.len()
            )));
        }

        self.points
            .iter()
            .map(|point| {
                let offset = (point.address - self.start) as usize;
                let raw =
                    point
                        .data_type
                        .decode(&words[offset..], point.byte_order, point.bit_position)?;
                Ok(DecodedValue {
                    point_id: point.id,
                    category: point.category,
                    value: point.transform.apply(raw, point.data_type),
                })
            })
            .collect()
    }

    #[inline]
    fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.quantity)
    }
}

/// The ordered batch list of one channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    batches: Vec<ReadBatch>,
}

impl BatchPlan {
    #[inline]
    pub fn batches(&self) -> &[ReadBatch] {
        &self.batches
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn point_count(&self) -> usize {
        self.batches.iter().map(|b| b.points.len()).sum()
    }
}

/// Pure planner; performs no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchPlanner {
    limits: DeviceLimits,
}

impl BatchPlanner {
    pub fn new(limits: DeviceLimits) -> Self {
        Self { limits }
    }

    pub fn plan(&self, channel_id: u16, points: &[Point]) -> ConfigResult<BatchPlan> {
        let mut sorted: Vec<&Point> = points.iter().collect();
        sorted.sort_by_key(|p| (p.slave_id, p.function_code, p.address, p.id));

        let mut batches: Vec<ReadBatch> = Vec::with_capacity(points.len() / 8 + 1);
        let mut current: Option<ReadBatch> = None;

        for point in sorted {
            let limit = self.limits.read_limit(point.function_code);
            if point.width() > limit {
                return Err(ConfigError::PointTooWide {
                    channel_id,
                    point_id: point.id,
                    width: point.width(),
                    limit,
                });
            }
            if point.end() > u32::from(u16::MAX) + 1 {
                return Err(ConfigError::invalid_point(
                    channel_id,
                    point.id,
                    "address range overflows 0xFFFF",
                ));
            }

            if let Some(batch) = current.as_mut() {
                if self.fits(batch, point, limit) {
                    let merged_end = batch.end().max(point.end());
                    batch.quantity = (merged_end - u32::from(batch.start)) as u16;
                    batch.points.push(point.clone());
                    continue;
                }
            }

            if let Some(done) = current.take() {
                batches.push(done);
            }
            current = Some(ReadBatch {
                index: batches.len(),
                slave_id: point.slave_id,
                function_code: point.function_code,
                start: point.address,
                quantity: point.width(),
                points: vec![point.clone()],
            });
        }
        if let Some(done) = current {
            batches.push(done);
        }

        Ok(BatchPlan { batches })
    }

    fn fits(&self, batch: &ReadBatch, point: &Point, limit: u16) -> bool {
        if batch.slave_id != point.slave_id || batch.function_code != point.function_code {
            return false;
        }
        let gap = u32::from(point.address).saturating_sub(batch.end());
        let merged_end = batch.end().max(point.end());
        let span = merged_end - u32::from(batch.start);
        gap <= u32::from(self.limits.max_gap) && span <= u32::from(limit)
    }
}

// ============================================================================
// Tests
// ============================================================================
