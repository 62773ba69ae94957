//! Plan arbitrary point tables and check the batch invariants: every point
//! in exactly one batch, batches inside the read limit and the address space.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_acquisition::{BatchPlanner, DataType, DeviceLimits, Point};

#[derive(Debug, Arbitrary)]
struct RawPoint {
    slave: u8,
    table: u8,
    address: u16,
    kind: u8,
}

#[derive(Debug, Arbitrary)]
struct Input {
    max_registers: u8,
    max_gap: u8,
    points: Vec<RawPoint>,
}

const TYPES: [DataType; 6] = [
    DataType::UInt16,
    DataType::Int16,
    DataType::UInt32,
    DataType::Float32,
    DataType::Int64,
    DataType::Float64,
];

fuzz_target!(|input: Input| {
    let limits = DeviceLimits::new()
        .with_max_read_registers(u16::from(input.max_registers).clamp(4, 125))
        .with_max_gap(u16::from(input.max_gap));

    let points: Vec<Point> = input
        .points
        .iter()
        .enumerate()
        .map(|(id, raw)| {
            let fc = raw.table % 4 + 1;
            let data_type = if fc <= 2 {
                DataType::Bool
            } else {
                TYPES[raw.kind as usize % TYPES.len()]
            };
            Point::new(id as u32, raw.slave, raw.address, data_type).with_function_code(fc)
        })
        .collect();

    let Ok(plan) = BatchPlanner::new(limits).plan(1, &points) else {
        return;
    };

    assert_eq!(plan.point_count(), points.len());
    for batch in plan.batches() {
        assert!(batch.quantity <= limits.read_limit(batch.function_code));
        assert!(u32::from(batch.start) + u32::from(batch.quantity) <= 0x1_0000);
        for point in &batch.points {
            assert!(point.address >= batch.start);
            assert!(point.end() <= u32::from(batch.start) + u32::from(batch.quantity));
        }
    }
});
