use criterion::{criterion_group, criterion_main, Criterion};
use diagram_collab::{
    BroadcastGroup, Codec, Collaborator, CursorPosition, DiagramDoc, DiagramSnapshot, Envelope,
    EnvelopeCodec, PresenceTracker, SyncFrame,
};
use serde_json::json;
use std::hint::black_box;
use tokio_tungstenite::tungstenite::Message;

fn diagram(nodes: usize) -> DiagramSnapshot {
    let nodes = (0..nodes)
        .map(|i| json!({ "id": format!("n{i}"), "label": format!("Node {i}"), "x": i * 10, "y": 0 }))
        .collect();
    let edges = (1..50)
        .map(|i| json!({ "id": format!("e{i}"), "source": format!("n{}", i - 1), "target": format!("n{i}") }))
        .collect();
    DiagramSnapshot::new(nodes, edges).with_title("Benchmark")
}

// ─── Wire format ─────────────────────────────────────────────────

fn bench_envelope_encode(c: &mut Criterion) {
    let envelope = Envelope::diagram_update("alice", diagram(50));

    c.bench_function("envelope_encode_50_nodes", |b| {
        b.iter(|| {
            black_box(black_box(&envelope).to_json().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let text = Envelope::diagram_update("alice", diagram(50)).to_json().unwrap();

    c.bench_function("envelope_decode_50_nodes", |b| {
        b.iter(|| {
            black_box(Envelope::from_json(black_box(&text)).unwrap());
        })
    });
}

fn bench_cursor_codec(c: &mut Criterion) {
    let codec = EnvelopeCodec;
    let envelope = Envelope::cursor("alice", CursorPosition::new(150.0, 250.0));
    let message = codec.encode(&envelope).unwrap();

    c.bench_function("cursor_envelope_encode", |b| {
        b.iter(|| {
            black_box(codec.encode(black_box(&envelope)).unwrap());
        })
    });
    c.bench_function("cursor_envelope_decode", |b| {
        b.iter(|| {
            black_box(codec.decode(black_box(message.clone())).unwrap());
        })
    });
}

fn bench_sync_frame(c: &mut Criterion) {
    let frame = SyncFrame::update("alice", vec![7u8; 256]);
    let bytes = frame.encode().unwrap();

    c.bench_function("sync_frame_encode_256B", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode().unwrap());
        })
    });
    c.bench_function("sync_frame_decode_256B", |b| {
        b.iter(|| {
            black_box(SyncFrame::decode(black_box(&bytes)).unwrap());
        })
    });
}

// ─── CRDT document ───────────────────────────────────────────────

fn bench_doc_apply_snapshot(c: &mut Criterion) {
    let first = diagram(200);
    let mut moved = first.clone();
    if let Some(node) = moved.nodes.get_mut(100) {
        node["x"] = json!(9999);
    }

    c.bench_function("doc_apply_200_nodes_fresh", |b| {
        b.iter(|| {
            let doc = DiagramDoc::new();
            black_box(doc.apply_snapshot(black_box(&first)).unwrap());
        })
    });

    let doc = DiagramDoc::new();
    doc.apply_snapshot(&first).unwrap();
    let mut flip = false;
    c.bench_function("doc_apply_200_nodes_one_moved", |b| {
        b.iter(|| {
            flip = !flip;
            let next = if flip { &moved } else { &first };
            black_box(doc.apply_snapshot(black_box(next)).unwrap());
        })
    });
}

fn bench_doc_snapshot(c: &mut Criterion) {
    let doc = DiagramDoc::new();
    doc.apply_snapshot(&diagram(200)).unwrap();

    c.bench_function("doc_snapshot_200_nodes", |b| {
        b.iter(|| {
            black_box(black_box(&doc).snapshot());
        })
    });
}

fn bench_doc_handshake_diff(c: &mut Criterion) {
    let doc = DiagramDoc::new();
    doc.apply_snapshot(&diagram(200)).unwrap();
    let empty = DiagramDoc::new().state_vector();

    c.bench_function("doc_diff_against_empty_200_nodes", |b| {
        b.iter(|| {
            black_box(doc.diff_since(black_box(&empty)).unwrap());
        })
    });
}

// ─── Presence ────────────────────────────────────────────────────

fn bench_presence_cursor(c: &mut Criterion) {
    let mut presence = PresenceTracker::new("local");
    let bob = Collaborator::new("bob", "Bob");
    presence.handle_envelope(&Envelope::join(&bob));
    let mut x = 0.0;

    c.bench_function("presence_handle_cursor", |b| {
        b.iter(|| {
            x += 1.0;
            let envelope = Envelope::cursor("bob", CursorPosition::new(x, 0.0));
            black_box(presence.handle_envelope(black_box(&envelope)));
        })
    });
}

fn bench_presence_100_joins(c: &mut Criterion) {
    let joins: Vec<Envelope> = (0..100)
        .map(|i| Envelope::join(&Collaborator::new(format!("u{i}"), format!("User {i}"))))
        .collect();

    c.bench_function("presence_100_joins_then_roster", |b| {
        b.iter(|| {
            let mut presence = PresenceTracker::new("local");
            for join in &joins {
                presence.handle_envelope(join);
            }
            black_box(presence.collaborators());
        })
    });
}

// ─── Hub fan-out ─────────────────────────────────────────────────

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let text = Envelope::cursor("alice", CursorPosition::new(1.0, 2.0))
        .to_json()
        .unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);
                let mut receivers = Vec::new();
                for id in 0..100 {
                    receivers.push(group.try_add_peer(id, 100).await.unwrap());
                }
                for _ in 0..1000 {
                    group.broadcast(0, Message::Text(text.clone().into()));
                }
                black_box(receivers);
            });
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_cursor_codec,
    bench_sync_frame,
    bench_doc_apply_snapshot,
    bench_doc_snapshot,
    bench_doc_handshake_diff,
    bench_presence_cursor,
    bench_presence_100_joins,
    bench_broadcast_100_peers,
);
criterion_main!(benches);
