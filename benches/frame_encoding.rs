//! Criterion benchmarks for checksum and frame hot paths.
//!
//! Every register exchange is checksummed on the way out and on the way back,
//! and every acquisition cycle encodes one frame, so these set the floor on
//! per-cycle CPU cost.
//!
//! Run with: cargo bench --bench frame_encoding

use bq76pl536_daq::{
    acquisition::{scale_voltage, ChipTelemetry, TelemetryFrame},
    protocol::Checksum,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn full_chain_frame(chips: usize) -> TelemetryFrame {
    TelemetryFrame {
        voltages: (0..chips * 6).map(|i| scale_voltage(9000 + i as u16)).collect(),
        chips: (0..chips)
            .map(|_| ChipTelemetry {
                expected_cells: 6,
                temperature1: 25,
                temperature2: 24,
                device_status: 0x81,
                fault_status: 0,
                alert_status: 0,
                undervoltage_fault: 0,
                overvoltage_fault: 0,
            })
            .collect(),
    }
}

/// Checksum over register-exchange-sized and frame-sized inputs.
fn checksum_throughput(c: &mut Criterion) {
    let checksum = Checksum::new();
    let mut group = c.benchmark_group("checksum");

    for size in [3usize, 6, 50, 450] {
        let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("compute", size), &data, |b, data| {
            b.iter(|| checksum.compute(black_box(data), 0));
        });
    }

    group.finish();
}

/// Frame encode and decode for chains of increasing length.
fn frame_codec(c: &mut Criterion) {
    let checksum = Checksum::new();
    let mut group = c.benchmark_group("frame");

    for chips in [1usize, 4, 32] {
        let frame = full_chain_frame(chips);
        let Ok(encoded) = frame.encode(&checksum) else {
            continue;
        };

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", chips), &frame, |b, frame| {
            b.iter(|| frame.encode(black_box(&checksum)));
        });
        group.bench_with_input(BenchmarkId::new("decode", chips), &encoded, |b, bytes| {
            b.iter(|| TelemetryFrame::decode(black_box(bytes), &checksum));
        });
    }

    group.finish();
}

criterion_group!(benches, checksum_throughput, frame_codec);
criterion_main!(benches);
