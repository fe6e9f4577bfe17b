//! Benchmarks for capacity merging and unit conversion
//!
//! Target: merging a full scan of 10 capacitors well under 1ms

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quota_reconciler::domain::{AzCapacity, CapacityData, CapacityReport, InputValue, Unit, ValueWithUnit};
use quota_reconciler::reconciler::merge_capacity;
use quota_reconciler::HierarchyStore;
use std::collections::BTreeMap;

fn capacity_report(capacitor: usize, services: usize, resources: usize) -> CapacityReport {
    let mut report = CapacityReport::new();
    for s in 0..services {
        let mut per_service = BTreeMap::new();
        for r in 0..resources {
            let mut per_az = BTreeMap::new();
            for az in ["az-a", "az-b", "az-c"] {
                per_az.insert(
                    az.to_string(),
                    AzCapacity {
                        capacity: 100 + capacitor as u64,
                        usage: 10,
                    },
                );
            }
            per_service.insert(
                format!("resource-{:02}", r),
                CapacityData {
                    capacity: 300 + capacitor as u64,
                    capacity_per_az: Some(per_az),
                    subcapacities: vec![serde_json::json!({"pool": format!("pool-{}", capacitor)})],
                },
            );
        }
        report.insert(format!("service-{:02}", s), per_service);
    }
    report
}

fn bench_merge_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("capacity_merge");

    let reports: Vec<CapacityReport> = (0..10).map(|i| capacity_report(i, 8, 16)).collect();
    group.throughput(Throughput::Elements(10 * 8 * 16));

    group.bench_function("merge_10_capacitors", |b| {
        b.iter(|| merge_capacity(black_box(&reports)));
    });

    let overlapping: Vec<CapacityReport> = (0..50).map(|i| capacity_report(i, 1, 4)).collect();
    group.throughput(Throughput::Elements(50 * 4));

    group.bench_function("merge_50_overlapping_capacitors", |b| {
        b.iter(|| merge_capacity(black_box(&overlapping)));
    });

    group.finish();
}

fn bench_unit_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("units");
    group.throughput(Throughput::Elements(1));

    group.bench_function("convert_gib_to_mib", |b| {
        let value = ValueWithUnit::new(1024, Unit::Gibibytes);
        b.iter(|| black_box(value).convert_to(black_box(Unit::Mebibytes)));
    });

    group.bench_function("parse_operator_input", |b| {
        let input = InputValue::Text("10 TiB".to_string());
        b.iter(|| black_box(&input).to_canonical(black_box(Unit::Mebibytes)));
    });

    group.finish();
}

fn bench_store_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("hierarchy_store");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = HierarchyStore::with_schema_version(1);
    rt.block_on(async {
        let mut tx = store.begin().await.unwrap();
        for i in 0..100 {
            tx.insert_domain("west", &format!("uuid-{:03}", i), &format!("domain-{}", i))
                .unwrap();
        }
        tx.commit().unwrap();
    });

    group.bench_function("read_only_transaction", |b| {
        b.iter(|| {
            rt.block_on(async {
                let tx = store.begin().await.unwrap();
                let found = tx.domain_by_uuid("west", black_box("uuid-050")).is_some();
                tx.rollback();
                found
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_merge_capacity,
    bench_unit_conversion,
    bench_store_transactions,
);
criterion_main!(benches);
