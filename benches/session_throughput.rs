//! Benchmarks for sequence tracking and session throughput
//!
//! - Gap bookkeeping under in-order, lossy and shuffled delivery
//! - End-to-end: bytes written to a session stream until the sink holds every payload
//!
//! Platform: Cross-platform (in-memory duplex streams, CI-safe)

use cd11_ingest::session::SequenceTracker;
use cd11_ingest::test_utils::{RecordingSink, encoded_data_frame};
use cd11_ingest::{SessionConfig, SessionRegistry, SessionServices, StationSession};
use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const FRAMES: u64 = 1_000;

fn bench_tracker(c: &mut Criterion) {
    let in_order: Vec<u64> = (1..=FRAMES).collect();
    // every tenth frame late by five positions
    let lossy: Vec<u64> = (1..=FRAMES).filter(|s| s % 10 != 0).chain((10..=FRAMES).step_by(10)).collect();
    // deterministic scramble, no rng dependency
    let mut shuffled = in_order.clone();
    for i in 0..shuffled.len() {
        let j = (i * 7919) % shuffled.len();
        shuffled.swap(i, j);
    }

    let mut group = c.benchmark_group("sequence_tracker");
    group.throughput(Throughput::Elements(FRAMES));

    for (name, seqs) in [("in_order", &in_order), ("late_tenth", &lossy), ("shuffled", &shuffled)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut tracker = SequenceTracker::new();
                for &seq in seqs {
                    black_box(tracker.on_sequence(seq));
                }
                tracker
            })
        });
    }

    group.finish();
}

fn bench_session(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let stream: Vec<u8> = (1..=FRAMES).flat_map(|seq| encoded_data_frame("ARCES", seq).to_vec()).collect();

    let mut group = c.benchmark_group("station_session");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.sample_size(20);

    group.bench_function("1000_data_frames_to_sink", |b| {
        b.iter_batched(
            RecordingSink::new,
            |sink| {
                runtime.block_on(async {
                    let services = SessionServices::new(Arc::new(sink.clone()), SessionRegistry::new(false));
                    let config = SessionConfig { station: "ARCES".into(), ..SessionConfig::default() };
                    let (consumer, mut provider) = tokio::io::duplex(1 << 20);
                    let handle = StationSession::spawn(consumer, config, SequenceTracker::new(), &services);

                    provider.write_all(&stream).await.unwrap();
                    while sink.len() < FRAMES as usize {
                        tokio::time::sleep(Duration::from_micros(50)).await;
                    }
                    handle.close();
                    handle.closed().await;
                })
            },
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_tracker, bench_session);
criterion_main!(benches);
