//! Performance benchmarks for soupsync-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use soupsync_engine::smart_sql::translate;
use soupsync_engine::{IndexSpec, QuerySpec, SoupStore};

fn contact(i: usize) -> Value {
    json!({
        "Id": format!("003{:06}", i),
        "FirstName": format!("First {}", i),
        "LastName": format!("Last {}", i % 50),
        "Age": i % 90,
        "Address": {"City": "Springfield", "Zip": format!("{:05}", i)},
    })
}

fn create_test_store() -> SoupStore {
    let store = SoupStore::open_in_memory().unwrap();
    store
        .register_soup(
            "contacts",
            &[
                IndexSpec::string("Id"),
                IndexSpec::string("LastName"),
                IndexSpec::integer("Age"),
                IndexSpec::full_text("FirstName"),
            ],
            false,
        )
        .unwrap();
    store
}

fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("insert_batch", size), size, |b, &size| {
            let store = create_test_store();
            let batch: Vec<Value> = (0..size).map(contact).collect();
            b.iter(|| {
                store
                    .upsert_entries("contacts", black_box(batch.clone()), None)
                    .unwrap()
            })
        });
    }

    // Every entry resolves to an update through the external id
    group.bench_function("update_by_external_id", |b| {
        let store = create_test_store();
        let batch: Vec<Value> = (0..100).map(contact).collect();
        store
            .upsert_entries("contacts", batch.clone(), Some("Id"))
            .unwrap();
        b.iter(|| {
            store
                .upsert_entries("contacts", black_box(batch.clone()), Some("Id"))
                .unwrap()
        })
    });

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    let store = create_test_store();
    let batch: Vec<Value> = (0..5000).map(contact).collect();
    store.upsert_entries("contacts", batch, None).unwrap();

    group.bench_function("exact", |b| {
        let spec = QuerySpec::exact("contacts", "LastName", "Last 7", 100);
        b.iter(|| store.query(black_box(&spec), 0).unwrap())
    });

    group.bench_function("range", |b| {
        let spec = QuerySpec::range("contacts", "Age", Some(json!(20)), Some(json!(30)), 100);
        b.iter(|| store.query(black_box(&spec), 0).unwrap())
    });

    group.bench_function("full_text", |b| {
        let spec = QuerySpec::full_text("contacts", Some("FirstName".into()), "First", 100);
        b.iter(|| store.query(black_box(&spec), 0).unwrap())
    });

    group.bench_function("smart_group_by", |b| {
        let spec = QuerySpec::smart(
            "SELECT {contacts:LastName}, COUNT(*) FROM {contacts} GROUP BY {contacts:LastName}",
            100,
        );
        b.iter(|| store.query(black_box(&spec), 0).unwrap())
    });

    group.finish();
}

fn bench_translate(c: &mut Criterion) {
    let mut group = c.benchmark_group("translate");
    let store = create_test_store();
    store
        .register_soup("accounts", &[IndexSpec::string("Id")], false)
        .unwrap();

    group.bench_function("single_soup", |b| {
        let sql = "SELECT {contacts:_soup} FROM {contacts} WHERE {contacts:LastName} = 'O''Brien {x}' \
                   ORDER BY {contacts:Age} DESC LIMIT 10";
        b.iter(|| translate(black_box(sql), &store).unwrap())
    });

    group.bench_function("join", |b| {
        let sql = "SELECT {accounts:Id}, {contacts:LastName} FROM {accounts}, {contacts} \
                   WHERE {accounts:Id} = {contacts:Id} AND {contacts:Address.City} = 'Springfield'";
        b.iter(|| translate(black_box(sql), &store).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_upsert, bench_query, bench_translate);
criterion_main!(benches);
