//! Benchmarks for flowchart replication
//!
//! Run with: cargo bench -p flowsync-core
//!
//! Baselines for:
//! - Applying node and edge operations
//! - Snapshot capture and application
//! - Envelope encoding and decoding
//! - Inbound frame dispatch

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowsync_core::flowchart::FlowchartDoc;
use flowsync_core::sync::{CollabMessage, Envelope, SyncProtocol};
use flowsync_core::{
    CollabConfig, Edge, EdgeOperation, FlowchartKey, FlowchartSnapshot, LocalFlowchartId, Node,
    NodeOperation, NodePatch, PeerId, Position, ReplicationState, UserInfo,
};
use tokio::time::Instant;

fn chain(size: usize) -> FlowchartDoc {
    let mut doc = FlowchartDoc::new(LocalFlowchartId::new("bench"));
    for i in 0..size {
        doc.apply_node_op(&NodeOperation::Add {
            node: Node::new(format!("n{}", i), "process", Position::new(i as f64, 0.0)),
        });
        if i > 0 {
            doc.apply_edge_op(&EdgeOperation::Add {
                edge: Edge::new(format!("e{}", i), format!("n{}", i - 1), format!("n{}", i)),
            });
        }
    }
    doc
}

// ============================================================================
// Operation Benchmarks
// ============================================================================

fn bench_node_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_ops");

    for size in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("add", size), &size, |b, &size| {
            b.iter_batched(
                || chain(size),
                |mut doc| {
                    black_box(doc.apply_node_op(&NodeOperation::Add {
                        node: Node::new("fresh", "decision", Position::default()),
                    }))
                },
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("move", size), &size, |b, &size| {
            b.iter_batched(
                || chain(size),
                |mut doc| {
                    black_box(doc.apply_node_op(&NodeOperation::Update {
                        id: format!("n{}", size / 2),
                        changes: NodePatch {
                            position: Some(Position::new(5.0, 5.0)),
                            ..Default::default()
                        },
                    }))
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    // Re-delivered add is a no-op
    group.bench_function("redelivered_add", |b| {
        let mut doc = chain(100);
        let op = NodeOperation::Add {
            node: Node::new("n50", "process", Position::new(50.0, 0.0)),
        };
        b.iter(|| black_box(doc.apply_node_op(&op)))
    });

    group.finish();
}

fn bench_edge_ops(c: &mut Criterion) {
    c.bench_function("edge_add_to_1000_node_doc", |b| {
        b.iter_batched(
            || chain(1000),
            |mut doc| {
                black_box(doc.apply_edge_op(&EdgeOperation::Add {
                    edge: Edge::new("shortcut", "n0", "n999"),
                }))
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

// ============================================================================
// Snapshot Benchmarks
// ============================================================================

fn bench_snapshots(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [10, 100, 1000] {
        let doc = chain(size);
        let snapshot = doc.snapshot();
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("capture", size), &doc, |b, doc| {
            b.iter(|| black_box(doc.snapshot()))
        });

        group.bench_with_input(BenchmarkId::new("apply", size), &snapshot, |b, snapshot| {
            b.iter_batched(
                || (FlowchartDoc::new(LocalFlowchartId::new("joiner")), snapshot.clone()),
                |(mut doc, snapshot)| black_box(doc.apply_snapshot(snapshot)),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

// ============================================================================
// Wire Benchmarks
// ============================================================================

fn bench_envelopes(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    let key = FlowchartKey::generate();
    let source = PeerId::random();

    let op = Envelope::new(
        CollabMessage::NodeOperation {
            operation: NodeOperation::Add {
                node: Node::new("n1", "process", Position::new(1.0, 2.0)),
            },
        },
        Some(key),
        source,
    );
    let op_frame = op.encode().unwrap();

    group.bench_function("encode_node_op", |b| b.iter(|| black_box(op.encode().unwrap())));
    group.bench_function("decode_node_op", |b| {
        b.iter(|| black_box(serde_json::from_slice::<Envelope>(&op_frame).unwrap()))
    });

    let snapshot: FlowchartSnapshot = chain(500).snapshot();
    let data = Envelope::new(CollabMessage::flowchart_data(snapshot), Some(key), source);
    let data_frame = data.encode().unwrap();
    group.throughput(Throughput::Bytes(data_frame.len() as u64));
    group.bench_function("encode_500_node_snapshot", |b| {
        b.iter(|| black_box(data.encode().unwrap()))
    });
    group.bench_function("decode_500_node_snapshot", |b| {
        b.iter(|| black_box(serde_json::from_slice::<Envelope>(&data_frame).unwrap()))
    });

    group.finish();
}

// ============================================================================
// Dispatch Benchmarks
// ============================================================================

fn bench_dispatch(c: &mut Criterion) {
    let key = FlowchartKey::generate();
    let remote = PeerId::random();

    let protocol = || {
        let state = ReplicationState::new(LocalFlowchartId::new("bench"));
        let mut protocol = SyncProtocol::new(
            PeerId::random(),
            UserInfo::new("bench", "#000000"),
            state,
            CollabConfig::default(),
        );
        protocol.share(key);
        protocol.peer_discovered(remote);
        protocol.channel_open(remote);
        protocol
    };

    let mut counter = 0u64;
    c.bench_function("dispatch_remote_node_add", |b| {
        let mut protocol = protocol();
        b.iter(|| {
            counter += 1;
            let frame = Envelope::new(
                CollabMessage::NodeOperation {
                    operation: NodeOperation::Add {
                        node: Node::new(format!("r{}", counter), "process", Position::default()),
                    },
                },
                Some(key),
                remote,
            )
            .encode()
            .unwrap();
            black_box(protocol.handle_inbound(remote, &frame, Instant::now()).unwrap())
        })
    });

    let foreign = Envelope::new(
        CollabMessage::CursorPosition { x: 1.0, y: 1.0 },
        Some(FlowchartKey::generate()),
        remote,
    )
    .encode()
    .unwrap();
    c.bench_function("dispatch_foreign_key_drop", |b| {
        let mut protocol = protocol();
        b.iter(|| black_box(protocol.handle_inbound(remote, &foreign, Instant::now())))
    });
}

criterion_group!(op_benches, bench_node_ops, bench_edge_ops);
criterion_group!(snapshot_benches, bench_snapshots);
criterion_group!(wire_benches, bench_envelopes, bench_dispatch);

criterion_main!(op_benches, snapshot_benches, wire_benches);
