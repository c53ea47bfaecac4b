//! Benchmarks for the message codec, routing and archives
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pipehub::archive::{DeepArchiveFetcher, DeepArchiveSaver};
use pipehub::message::codec::{decode, encode};
use pipehub::message::frame::MAX_PAYLOAD_SIZE;
use pipehub::message::MESSAGE_SIZE;
use pipehub::object::{Meta, ObjectType, SharedRegion};
use pipehub::router::Router;
use pipehub::{Id, Identity, Message, MessageFactory, Payload};

fn sample_messages() -> Vec<Message> {
    let f = MessageFactory::new(Id(12), 0);
    vec![
        f.make(Payload::Busy),
        f.make(Payload::connect(Id(12), "data_out", Id(13), "data_in")),
        f.make(Payload::SendText {
            text_type: pipehub::message::TextType::Info,
            reference_uuid: uuid::Uuid::nil(),
            reference_type: None,
            truncated: false,
            text: "computing timestep 12 of 40".into(),
        }),
    ]
}

fn bench_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    group.throughput(Throughput::Bytes(MESSAGE_SIZE as u64));

    for msg in sample_messages() {
        let ty = msg.message_type().to_string();
        group.bench_with_input(BenchmarkId::new("encode", &ty), &msg, |b, msg| {
            b.iter(|| encode(black_box(msg)))
        });
        let buf = encode(&msg).expect("sample fits");
        group.bench_with_input(BenchmarkId::new("decode", &ty), &buf, |b, buf| {
            b.iter(|| decode(black_box(buf), MAX_PAYLOAD_SIZE))
        });
    }

    group.finish();
}

fn bench_routing(c: &mut Criterion) {
    let router = Router::new(Identity::Hub, Id::MASTER_HUB);
    let msgs = sample_messages();
    c.bench_function("route_master", |b| {
        b.iter(|| {
            for msg in &msgs {
                black_box(router.route(msg, Identity::Manager, Id::MASTER_HUB));
            }
        })
    });
}

fn bench_archive(c: &mut Criterion) {
    let mut group = c.benchmark_group("deep_archive");

    for arrays in [1usize, 16, 128] {
        let src = SharedRegion::new("bench", 1, 0);
        let top = src.create_object(ObjectType::UnstructuredGrid, Meta::default());
        for i in 0..arrays {
            top.set_array(&format!("a{i}"), src.create_vector_from(vec![i as f32; 1024]));
        }

        group.bench_with_input(BenchmarkId::new("save", arrays), &top, |b, top| {
            b.iter(|| {
                let mut saver = DeepArchiveSaver::default();
                black_box(saver.save(top).expect("saving resident graph"))
            })
        });

        let mut saver = DeepArchiveSaver::default();
        let blob = saver.save(&top).expect("saving resident graph");
        let directory = saver.into_directory();
        group.bench_with_input(BenchmarkId::new("load", arrays), &blob, |b, blob| {
            b.iter(|| {
                let dst = SharedRegion::new("dst", 2, 0);
                let fetcher = DeepArchiveFetcher::new(dst, directory.clone());
                black_box(fetcher.load(blob).expect("loading complete archive"))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode_decode, bench_routing, bench_archive);
criterion_main!(benches);
