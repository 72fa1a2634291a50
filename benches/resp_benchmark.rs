//! Benchmarks for the request path: frame parsing, reply encoding, command
//! dispatch and pattern matching.
//! Run with: `cargo bench`

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use xdis::protocol::{into_command, RespParser};
use xdis::reply::{encode, Reply};
use xdis::server::pubsub::glob_match;
use xdis::{MemoryStorage, Service, ServiceOptions, Storager};

fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("resp_parsing");

    group.bench_function("set_command", |b| {
        let frame = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
        b.iter(|| {
            let mut parser = RespParser::new(64);
            parser.feed(black_box(frame));
            let value = parser.parse().unwrap().unwrap();
            into_command(value).unwrap()
        });
    });

    group.bench_function("inline_command", |b| {
        b.iter(|| {
            let mut parser = RespParser::new(64);
            parser.feed(black_box(b"GET somekey\r\n"));
            parser.parse().unwrap()
        });
    });

    for n in [10usize, 100] {
        let mut pipeline = Vec::new();
        for i in 0..n {
            pipeline.extend_from_slice(format!("*2\r\n$3\r\nGET\r\n$4\r\nk{:03}\r\n", i).as_bytes());
        }
        group.bench_with_input(BenchmarkId::new("pipeline", n), &pipeline, |b, data| {
            b.iter(|| {
                let mut parser = RespParser::new(data.len());
                parser.feed(data);
                let mut count = 0;
                while let Some(frame) = parser.parse().unwrap() {
                    black_box(frame);
                    count += 1;
                }
                count
            });
        });
    }

    group.finish();
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply_encoding");

    group.bench_function("bulk", |b| {
        b.iter(|| encode(Ok(Reply::bulk(black_box(Bytes::from_static(b"hello world"))))).unwrap().serialize());
    });

    group.bench_function("array_100", |b| {
        let items: Vec<Bytes> = (0..100).map(|i| Bytes::from(format!("member{}", i))).collect();
        b.iter(|| {
            let frame = encode(Ok(Reply::bulks(items.iter().cloned()))).unwrap();
            let mut buf = BytesMut::with_capacity(2048);
            frame.write_to(&mut buf);
            buf
        });
    });

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let service = Service::new(Arc::new(MemoryStorage::new(16, 1024)), ServiceOptions::default());
    let mut session = service.on_accept("127.0.0.1:1").unwrap();
    let set_args = vec![Bytes::from("key"), Bytes::from("value")];
    let get_args = vec![Bytes::from("key")];

    let mut group = c.benchmark_group("dispatch");
    group.bench_function("set", |b| {
        b.iter(|| rt.block_on(service.dispatch(&mut session, b"SET", &set_args)).unwrap());
    });
    group.bench_function("get", |b| {
        b.iter(|| rt.block_on(service.dispatch(&mut session, b"GET", &get_args)).unwrap());
    });
    group.finish();
}

fn bench_slots_and_patterns(c: &mut Criterion) {
    let storage = MemoryStorage::new(1, 1024);
    let db = storage.select(0).unwrap();
    let keys: Vec<Bytes> = (0..100).map(|i| Bytes::from(format!("{{user{}}}:profile", i))).collect();

    c.bench_function("slotshashkey_100", |b| {
        let slots = db.slots().unwrap();
        b.iter(|| slots.hash_keys(black_box(&keys)).unwrap());
    });

    c.bench_function("glob_match", |b| {
        b.iter(|| glob_match(black_box(b"news.*.[a-m]*"), black_box(b"news.sports.football")));
    });
}

criterion_group!(
    benches,
    bench_parsing,
    bench_encoding,
    bench_dispatch,
    bench_slots_and_patterns
);
criterion_main!(benches);
