//! Criterion benchmarks for the codec, reassembly and session throughput.

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rudp_tokio::rudp_core::{
    CoreConfig, FragmentOutcome, Fragmenter, NoopMetrics, Packet, PacketCodec, Reassembler,
    Session,
};
use rudp_tokio::{ChannelDispatcher, Collaborators, Connection, Listener, TransportConfig};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Perfect transfer: every datagram from src delivered to dst.
fn transfer(src: &mut Session, dst: &mut Session, now: Instant) {
    for datagram in src.drain_output().collect::<Vec<_>>() {
        let _ = dst.input(datagram, now);
    }
}

fn connected_pair(config: CoreConfig) -> (Session, Session) {
    let now = Instant::now();
    let mut client = Session::connect(1, config.clone(), Arc::new(NoopMetrics), Bytes::new(), now);
    let mut server = Session::accept(1, config, Arc::new(NoopMetrics), Bytes::new(), now);
    transfer(&mut client, &mut server, now);
    server.complete_login(now).unwrap();
    transfer(&mut server, &mut client, now);
    (client, server)
}

fn codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let config = CoreConfig::default();
    let codec = PacketCodec::from_config(&config);
    let mut fragmenter = Fragmenter::new(config.max_fragment_payload(), config.max_message_size);

    let fragments = fragmenter.split(0, 1, &[0xAB; 1000]).unwrap();
    let packet = Packet::data(0, fragments);
    let raw = codec.serialize(&packet).unwrap();
    group.throughput(Throughput::Bytes(raw.len() as u64));

    group.bench_function("serialize", |b| {
        b.iter(|| codec.serialize(&packet).unwrap());
    });
    group.bench_function("parse", |b| {
        b.iter(|| codec.parse(raw.clone()).unwrap());
    });

    group.finish();
}

fn reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    let config = CoreConfig::default();

    for &size in &[1_000usize, 64 * 1024, 512 * 1024] {
        let mut fragmenter = Fragmenter::new(config.max_fragment_payload(), config.max_message_size);
        let mut fragments = fragmenter.split(0, 1, &vec![0x5A; size]).unwrap();
        fragments.shuffle(&mut StdRng::seed_from_u64(7));
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("shuffled", size), &fragments, |b, fragments| {
            b.iter(|| {
                let mut reassembler = Reassembler::new(&config);
                let now = Instant::now();
                let mut complete = false;
                for fragment in fragments.iter().cloned() {
                    if let Ok(FragmentOutcome::Complete(_)) = reassembler.on_fragment(fragment, now) {
                        complete = true;
                    }
                }
                assert!(complete);
            });
        });
    }

    group.finish();
}

fn session_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_throughput");

    for &msg_count in &[10usize, 100, 500] {
        let msg_size = 1024;
        group.throughput(Throughput::Bytes((msg_count * msg_size) as u64));

        group.bench_with_input(
            BenchmarkId::new("1KB_messages", msg_count),
            &msg_count,
            |b, &count| {
                b.iter(|| {
                    let (mut client, mut server) = connected_pair(CoreConfig::default());
                    let now = Instant::now();
                    let payload = vec![0xABu8; msg_size];
                    for _ in 0..count {
                        client.send(0, 1, &payload).unwrap();
                    }

                    let mut received = 0;
                    while received < count {
                        client.update(now);
                        transfer(&mut client, &mut server, now);
                        while server.recv().is_some() {
                            received += 1;
                        }
                        server.update(now);
                        transfer(&mut server, &mut client, now);
                    }
                });
            },
        );
    }

    group.finish();
}

fn loopback_echo(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (listener, client, deliveries) = runtime.block_on(async {
        let (dispatcher, deliveries) = ChannelDispatcher::new(4096);
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            TransportConfig::default(),
            Collaborators::new(Arc::new(dispatcher)),
        )
        .await
        .unwrap();
        let client = Connection::connect(listener.local_addr(), "bench", TransportConfig::default())
            .await
            .unwrap();
        (listener, client, Arc::new(Mutex::new(deliveries)))
    });

    let mut group = c.benchmark_group("loopback");
    group.throughput(Throughput::Bytes(16 * 1024));
    group.bench_function("16KB_one_way", |b| {
        b.to_async(&runtime).iter(|| {
            let client = &client;
            let deliveries = deliveries.clone();
            async move {
                client.send(0, 1, vec![0u8; 16 * 1024]).await.unwrap();
                deliveries.lock().await.recv().await.unwrap();
            }
        });
    });
    group.finish();

    drop(client);
    drop(listener);
}

criterion_group!(benches, codec, reassembly, session_throughput, loopback_echo);
criterion_main!(benches);
