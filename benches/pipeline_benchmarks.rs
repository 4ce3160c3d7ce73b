//! Pipeline Performance Benchmarks
//!
//! Benchmarks for affinity hashing, Client Hello sniffing, leaf certificate
//! lookup and mux stream throughput

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_ingress::affinity;
use relay_ingress::mitm::{CaKeyPair, HostIdentifier, MitmMaterial};
use relay_ingress::mux::{MuxConfig, Session};
use relay_ingress::sniff::Sniffer;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;

/// TLS record carrying a Client Hello with SNI and ALPN
fn client_hello(host: &str) -> Vec<u8> {
    let mut sni = vec![0u8];
    sni.extend_from_slice(&(host.len() as u16).to_be_bytes());
    sni.extend_from_slice(host.as_bytes());
    let mut sni_ext = (sni.len() as u16).to_be_bytes().to_vec();
    sni_ext.extend_from_slice(&sni);

    let alpn = b"\x02h2\x08http/1.1";
    let mut alpn_ext = (alpn.len() as u16).to_be_bytes().to_vec();
    alpn_ext.extend_from_slice(alpn);

    let mut extensions = Vec::new();
    for (kind, data) in [(0x0000u16, sni_ext), (0x0010u16, alpn_ext)] {
        extensions.extend_from_slice(&kind.to_be_bytes());
        extensions.extend_from_slice(&(data.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&data);
    }

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Benchmark upstream selection
fn bench_affinity(c: &mut Criterion) {
    let mut group = c.benchmark_group("affinity");
    let upstreams: Vec<String> = (0..16).map(|i| format!("10.0.0.{}:443", i)).collect();

    group.bench_function("select_16_candidates", |b| {
        b.iter(|| affinity::select(black_box("client-203.0.113.9"), &upstreams))
    });

    group.finish();
}

/// Benchmark sniffing a buffered Client Hello
fn bench_sniffing(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("sniffing");
    let hello = client_hello("www.example.com");
    let sniffer = Sniffer::new(true, Duration::from_secs(1));

    group.throughput(Throughput::Bytes(hello.len() as u64));
    group.bench_function("client_hello", |b| {
        b.to_async(&rt).iter(|| async {
            let (result, _) = sniffer.sniff(black_box(hello.as_slice())).await.unwrap();
            result
        })
    });

    group.finish();
}

/// Benchmark leaf certificate lookup
fn bench_leaf_cache(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("leaf_cache");
    let material = MitmMaterial::new(CaKeyPair::generate("Bench CA").unwrap());

    rt.block_on(material.leaves().get_or_mint("cached.example.com"))
        .unwrap();

    group.bench_function("hit", |b| {
        b.to_async(&rt)
            .iter(|| material.leaves().get_or_mint(black_box("cached.example.com")))
    });

    let fresh = HostIdentifier::from_hostname("fresh.example.com").unwrap();
    group.sample_size(20);
    group.bench_function("mint", |b| b.iter(|| material.ca().sign(black_box(&fresh)).unwrap()));

    group.finish();
}

/// Benchmark one mux stream moving 1 MiB
fn bench_mux_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("mux");
    const SIZE: usize = 1024 * 1024;
    let payload = vec![0xabu8; SIZE];

    group.throughput(Throughput::Bytes(SIZE as u64));
    group.sample_size(20);
    group.bench_function("stream_1mib", |b| {
        b.to_async(&rt).iter(|| async {
            let (left, right) = tokio::io::duplex(256 * 1024);
            let (client, server) = tokio::join!(
                Session::client(left, MuxConfig::default()),
                Session::server(right, MuxConfig::default())
            );
            let (client, server) = (client.unwrap(), server.unwrap());

            let mut outbound = client.open_stream().await.unwrap();
            let writer = async {
                outbound.write_all(&payload).await.unwrap();
                outbound.shutdown().await.unwrap();
            };
            let reader = async {
                let mut inbound = server.accept_stream().await.unwrap();
                let mut sink = Vec::with_capacity(SIZE);
                inbound.read_to_end(&mut sink).await.unwrap();
                sink.len()
            };
            let ((), received) = tokio::join!(writer, reader);
            assert_eq!(received, SIZE);
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_affinity,
    bench_sniffing,
    bench_leaf_cache,
    bench_mux_throughput
);
criterion_main!(benches);
