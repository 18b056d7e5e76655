//! Benchmarks for RPC frame encoding and classification
//!
//! Run with: cargo bench

use ciborium::Value;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tsnode::network::connection::RemoteAddr;
use tsnode::network::message::{self, classify, PeerAddr};
use tsnode::network::wire::{decode_payload, serialize_frame};

/// A `peers` reply the size a busy node would gossip
fn peers_reply(count: u16) -> Value {
    let peers = (0..count)
        .map(|i| {
            PeerAddr {
                addr: RemoteAddr::new(
                    std::net::Ipv4Addr::new(203, 0, (i >> 8) as u8, i as u8).into(),
                    3963,
                ),
                incoming: Some(i % 2 == 0),
            }
            .to_value()
        })
        .collect();
    message::result(Value::Array(peers), 7)
}

fn bench_serialize(c: &mut Criterion) {
    let request = message::request("whoami", vec![], 1);
    let reply = peers_reply(256);

    c.bench_function("serialize_request", |b| {
        b.iter(|| serialize_frame(black_box(&request)).unwrap())
    });

    c.bench_function("serialize_peers_256", |b| {
        b.iter(|| serialize_frame(black_box(&reply)).unwrap())
    });
}

fn bench_decode(c: &mut Criterion) {
    let frame = serialize_frame(&peers_reply(256)).unwrap();
    let payload = &frame[4..];

    c.bench_function("decode_peers_256", |b| {
        b.iter(|| decode_payload(black_box(payload)).unwrap())
    });

    c.bench_function("decode_and_classify_peers_256", |b| {
        b.iter(|| classify(decode_payload(black_box(payload)).unwrap()).unwrap())
    });
}

criterion_group!(benches, bench_serialize, bench_decode);
criterion_main!(benches);
