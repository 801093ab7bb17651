//! Basic benchmarks for the `raw_collections` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use raw_collections::{AppendBuffer, ByteSpan, FixedBytes, Global, RawHashTable, RawList};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const ITEM_COUNT: u64 = 1024;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("raw_basic");

    group.bench_function("list_push_growing", |b| {
        b.iter(|| {
            let mut list = RawList::<u64>::new_in(Global);

            for value in 0..ITEM_COUNT {
                list.push(black_box(value)).unwrap();
            }

            black_box(list)
        });
    });

    group.bench_function("append_buffer_add_reserved", |b| {
        b.iter(|| {
            let mut buffer = AppendBuffer::new_in(8, Global);
            buffer.ensure_slack(12 * 1024).unwrap();

            for value in 0..ITEM_COUNT {
                buffer
                    .add_pair_no_resize(black_box(value), black_box(u32::try_from(value).unwrap()))
                    .unwrap();
            }

            black_box(buffer)
        });
    });

    let mut source = AppendBuffer::new_in(8, Global);
    for value in 0..ITEM_COUNT {
        source.add(value).unwrap();
    }

    group.bench_function("reader_read_all", |b| {
        b.iter(|| {
            let mut reader = source.reader();
            let mut sum = 0_u64;

            while let Some(value) = reader.try_read_next::<u64>() {
                sum = sum.wrapping_add(value);
            }

            black_box(sum)
        });
    });

    group.bench_function("table_insert_reserved", |b| {
        b.iter(|| {
            let mut table = RawHashTable::<u64>::with_capacity(1024).unwrap();

            for key in 0..ITEM_COUNT {
                table.add_unchecked_no_resize(black_box(key)).unwrap();
            }

            black_box(table)
        });
    });

    let mut table = RawHashTable::<u64>::with_capacity(1024).unwrap();
    for key in 0..ITEM_COUNT {
        table.add_unchecked_no_resize(key).unwrap();
    }

    group.bench_function("table_find_hit", |b| {
        b.iter(|| black_box(table.find(black_box(&512))));
    });

    group.bench_function("table_find_miss", |b| {
        b.iter(|| black_box(table.find(black_box(&(ITEM_COUNT * 2)))));
    });

    let mut names = RawHashTable::<FixedBytes<32>>::with_capacity(1024).unwrap();
    for index in 0..ITEM_COUNT {
        let name = format!("entry-{index}");
        names
            .add_unchecked_no_resize(FixedBytes::try_from(name.as_str()).unwrap())
            .unwrap();
    }

    group.bench_function("table_find_by_content", |b| {
        b.iter(|| {
            black_box(
                names
                    .find_normalized_string_key_index(black_box(ByteSpan::from("entry-512")))
                    .unwrap(),
            )
        });
    });

    group.finish();
}
