//! Benchmarks for the DNS response cache.
//!
//! Measures the hit path the resolver takes on every question and the cost
//! of inserting fresh upstream answers into a full cache.

use std::net::Ipv4Addr;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};

use detour_router::cache::DnsCache;
use detour_router::dns::{new_query, question_key};

const CAPACITY: usize = 4096;

fn response(host: &str, octet: u8) -> (String, Message) {
    let mut msg = new_query(host, RecordType::A).expect("valid host");
    let key = question_key(&msg.queries()[0]);
    let name = msg.queries()[0].name().clone();
    msg.set_message_type(MessageType::Response);
    msg.add_answer(Record::from_rdata(
        name,
        300,
        RData::A(A(Ipv4Addr::new(93, 184, 216, octet))),
    ));
    (key, msg)
}

fn filled_cache() -> (DnsCache, Vec<String>) {
    let cache = DnsCache::new(CAPACITY);
    let keys = (0..CAPACITY)
        .map(|i| {
            let (key, msg) = response(&format!("host{i}.example.com"), (i % 250) as u8);
            cache.put(&key, &msg);
            key
        })
        .collect();
    (cache, keys)
}

fn bench_get(c: &mut Criterion) {
    let (cache, keys) = filled_cache();
    let (miss, _) = response("missing.example.org", 1);

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("get", "hit"), |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(cache.get(black_box(&keys[i])))
        })
    });

    group.bench_function(BenchmarkId::new("get", "miss"), |b| {
        b.iter(|| black_box(cache.get(black_box(&miss))))
    });

    group.finish();
}

fn bench_put(c: &mut Criterion) {
    let (cache, _) = filled_cache();
    let fresh: Vec<_> = (0..1024)
        .map(|i| response(&format!("fresh{i}.example.net"), (i % 250) as u8))
        .collect();

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));

    // Every insert evicts the least recently used entry.
    group.bench_function(BenchmarkId::new("put", "evicting"), |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % fresh.len();
            let (key, msg) = &fresh[i];
            black_box(cache.put(key, msg))
        })
    });

    group.bench_function(BenchmarkId::new("question_key", "a"), |b| {
        let (_, msg) = &fresh[0];
        b.iter(|| black_box(question_key(black_box(&msg.queries()[0]))))
    });

    group.finish();
}

criterion_group!(benches, bench_get, bench_put);
criterion_main!(benches);
