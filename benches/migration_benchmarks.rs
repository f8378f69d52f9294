//! Migration Performance Benchmarks
//!
//! Measures the hot paths of the migration core: frame coding, routing a
//! packet on the active path and a full NAT rebinding round trip.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gquic_migration::prelude::*;
use gquic_migration::validator::ChallengeToken;
use std::net::SocketAddr;
use std::time::Instant;

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn server(now: Instant) -> (Connection, ConnectionId) {
    let local_cid = ConnectionId::from_slice(&[0x5a; 8]).unwrap();
    let connection = Connection::new(
        Side::Server,
        MigrationConfig::default(),
        addr("10.0.0.1:443"),
        addr("192.0.2.1:5000"),
        local_cid.clone(),
        ConnectionId::from_slice(&[0xc1; 8]).unwrap(),
        TransportParameters { active_connection_id_limit: 4, ..Default::default() },
        now,
    )
    .unwrap();
    (connection, local_cid)
}

/// Benchmark frame encoding and decoding
fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    let frames = vec![
        ("path_challenge", Frame::PathChallenge { token: ChallengeToken::new([7; 8]) }),
        (
            "new_connection_id",
            Frame::NewConnectionId {
                sequence_number: 42,
                retire_prior_to: 40,
                connection_id: ConnectionId::from_slice(&[9; 16]).unwrap(),
                stateless_reset_token: StatelessResetToken::new([3; 16]),
            },
        ),
        (
            "stream_1k",
            Frame::Stream { stream_id: 4, offset: 65536, data: Bytes::from(vec![0u8; 1024]), fin: false },
        ),
    ];

    for (name, frame) in &frames {
        group.throughput(Throughput::Bytes(frame.encoded_len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", name), frame, |b, frame| {
            b.iter(|| black_box(frame.encode()));
        });

        let encoded = frame.encode();
        group.bench_with_input(BenchmarkId::new("decode", name), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark packets arriving on the active path
fn bench_active_path_packets(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_handling");
    group.throughput(Throughput::Elements(1));

    group.bench_function("active_path_stream", |b| {
        let now = Instant::now();
        let (mut connection, cid) = server(now);
        let mut pn = 0;
        b.iter(|| {
            pn += 1;
            let packet = IncomingPacket::new(
                addr("10.0.0.1:443"),
                addr("192.0.2.1:5000"),
                cid.clone(),
                pn,
                vec![Frame::Stream { stream_id: 0, offset: pn, data: Bytes::from_static(b"x"), fin: false }],
            );
            let disposition = connection.on_packet_received(packet, now).unwrap();
            while connection.poll_event().is_some() {}
            black_box(disposition)
        });
    });

    group.bench_function("endpoint_routing", |b| {
        let now = Instant::now();
        let endpoint = Endpoint::new();
        let mut cids = Vec::new();
        for i in 0..64u8 {
            let local_cid = ConnectionId::from_slice(&[i; 8]).unwrap();
            let connection = Connection::new(
                Side::Server,
                MigrationConfig::default(),
                addr("10.0.0.1:443"),
                addr("192.0.2.1:5000"),
                local_cid.clone(),
                ConnectionId::from_slice(&[0xff, i]).unwrap(),
                TransportParameters::default(),
                now,
            )
            .unwrap();
            endpoint.insert(connection);
            cids.push(local_cid);
        }
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % cids.len();
            black_box(endpoint.resolve(&cids[i], now).is_some())
        });
    });

    group.finish();
}

/// Benchmark a full NAT rebinding: detection, challenge, response, promotion
fn bench_nat_rebinding(c: &mut Criterion) {
    let mut group = c.benchmark_group("migration");

    group.bench_function("nat_rebinding", |b| {
        b.iter(|| {
            let now = Instant::now();
            let (mut connection, cid) = server(now);
            let rebound = addr("192.0.2.1:6000");

            let packet = IncomingPacket::new(addr("10.0.0.1:443"), rebound, cid.clone(), 1, vec![Frame::Ping])
                .with_size(1200);
            connection.on_packet_received(packet, now).unwrap();

            let token = std::iter::from_fn(|| connection.poll_transmit())
                .flat_map(|transmit| transmit.frames)
                .find_map(|frame| match frame {
                    Frame::PathChallenge { token } => Some(token),
                    _ => None,
                })
                .unwrap();

            let response = IncomingPacket::new(
                addr("10.0.0.1:443"),
                rebound,
                cid.clone(),
                2,
                vec![Frame::PathResponse { token }],
            );
            connection.on_packet_received(response, now).unwrap();
            black_box(connection.active_path())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_frame_codec, bench_active_path_packets, bench_nat_rebinding);
criterion_main!(benches);
