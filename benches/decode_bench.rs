use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use rapidpb::{
    compile, CompileOptions, DescriptorPool, FieldDescriptor, Kind, MessageDescriptor, Shared,
    Syntax, UnmarshalOptions,
};

fn bench_pool() -> DescriptorPool {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("bench.Item", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::scalar("id", 1, Kind::Uint64),
            FieldDescriptor::scalar("name", 2, Kind::String),
        ]),
    )
    .unwrap();
    pool.add_message(
        MessageDescriptor::new("bench.Batch", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::scalar("seq", 1, Kind::Uint64),
            FieldDescriptor::repeated("values", 2, Kind::Int32),
            FieldDescriptor::repeated_message("items", 3, "bench.Item"),
        ]),
    )
    .unwrap();
    pool
}

fn varint(mut v: u64, out: &mut Vec<u8>) {
    while v >= 0x80 {
        out.push(v as u8 | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn batch_payload(items: usize) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0x08);
    varint(12345, &mut out);

    let mut packed = Vec::new();
    for i in 0..64u64 {
        varint(i, &mut packed);
    }
    out.push(0x12);
    varint(packed.len() as u64, &mut out);
    out.extend_from_slice(&packed);

    for i in 0..items {
        let mut item = Vec::new();
        item.push(0x08);
        varint(i as u64, &mut item);
        item.push(0x12);
        let name = format!("item-{i}");
        varint(name.len() as u64, &mut item);
        item.extend_from_slice(name.as_bytes());

        out.push(0x1A);
        varint(item.len() as u64, &mut out);
        out.extend_from_slice(&item);
    }
    out
}

fn bench_decode(c: &mut Criterion) {
    let pool = bench_pool();
    let ty = compile(&pool, "bench.Batch", &CompileOptions::new()).unwrap();

    let mut group = c.benchmark_group("decode");
    for items in [0usize, 16, 256] {
        let payload = batch_payload(items);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_function(format!("batch/{items}"), |b| {
            let mut shared = Shared::new();
            let opts = UnmarshalOptions::new().allow_alias(true);
            b.iter(|| {
                {
                    let msg = shared.new_message(&ty);
                    msg.unmarshal_with(black_box(payload.as_slice()), &opts)
                        .unwrap();
                    black_box(&msg);
                }
                shared.free();
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
