use basalt::{Engine, EngineConfig, LogicalType, Schema, Value};
use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

fn batch(start: i64, len: i64) -> basalt::data::Batch {
    basalt::data::Batch::new(vec![
        basalt::ColumnVector::from_values(
            LogicalType::Int64,
            (start..start + len).map(Value::Int64).collect(),
        ),
        basalt::ColumnVector::from_values(
            LogicalType::Int64,
            (start..start + len).map(|v| Value::Int64(v * 10)).collect(),
        ),
    ])
    .unwrap()
}

fn bench_append(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    let txn = engine.start_txn();
    let db = txn.create_database("bench").unwrap();
    let table = txn
        .create_table(
            db,
            Schema::new(
                "t",
                vec![("k", LogicalType::Int64), ("v", LogicalType::Int64)],
                "k",
                8192,
                16,
            )
            .unwrap(),
        )
        .unwrap();
    txn.commit().unwrap();

    let mut next = 0i64;
    c.bench_function("append_1k_rows", |b| {
        b.iter(|| {
            let txn = engine.start_txn();
            txn.append(db, table, batch(next, 1000)).unwrap();
            txn.commit().unwrap();
            next += 1000;
        })
    });
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
