//! Benchmark suite for KPI derivation and condition group selection

use adrule::engine::condition::ConditionGroup;
use adrule::engine::report::Report;
use adrule::engine::{Condition, GroupOperator, Kpi, Operator};
use arrow::array::{Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

/// `size` rows spread over `size / 10` keywords.
fn create_keyword_report(size: usize) -> Report {
    let schema = Schema::new(vec![
        Field::new("keywordId", DataType::Int64, false),
        Field::new("localSpend", DataType::Float64, true),
        Field::new("impressions", DataType::Int64, true),
        Field::new("taps", DataType::Int64, true),
        Field::new("installs", DataType::Int64, true),
    ]);

    let keywords = (size / 10).max(1) as i64;
    let ids: Vec<i64> = (0..size as i64).map(|i| i % keywords).collect();
    let spend: Vec<f64> = (0..size).map(|i| (i % 97) as f64 * 0.75).collect();
    let impressions: Vec<i64> = (0..size as i64).map(|i| (i % 53) * 20).collect();
    let taps: Vec<i64> = (0..size as i64).map(|i| i % 23).collect();
    let installs: Vec<i64> = (0..size as i64).map(|i| i % 5).collect();

    let batch = RecordBatch::try_new(
        Arc::new(schema),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(Float64Array::from(spend)),
            Arc::new(Int64Array::from(impressions)),
            Arc::new(Int64Array::from(taps)),
            Arc::new(Int64Array::from(installs)),
        ],
    )
    .unwrap();
    Report::new(batch)
}

/// `cpt < 2 AND (taps >= 50 OR cpa > 10 OR (ttr > 0.05 AND cpm < 40))`
fn nested_group() -> ConditionGroup {
    let mut group = ConditionGroup::new(GroupOperator::All);
    let root = group.root();
    group.add_condition(root, Condition::new(Kpi::Cpt, Operator::Less, 2.0));
    let any = group.add_group(root, GroupOperator::Any);
    group.add_condition(any, Condition::new(Kpi::Taps, Operator::Geq, 50.0));
    group.add_condition(any, Condition::new(Kpi::Cpa, Operator::Greater, 10.0));
    let all = group.add_group(any, GroupOperator::All);
    group.add_condition(all, Condition::new(Kpi::Ttr, Operator::Greater, 0.05));
    group.add_condition(all, Condition::new(Kpi::Cpm, Operator::Less, 40.0));
    group
}

fn benchmark_kpi_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi_derivation");
    for size in [1_000, 10_000, 100_000] {
        let report = create_keyword_report(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &report, |b, report| {
            b.iter(|| {
                let mut report = report.clone();
                Kpi::Cpa.ensure_columns(&mut report, "keywordId").unwrap();
                black_box(report)
            });
        });
    }
    group.finish();
}

fn benchmark_single_condition(c: &mut Criterion) {
    let report = create_keyword_report(10_000);
    let condition = ConditionGroup::new(GroupOperator::All).with_condition(Condition::new(Kpi::Spend, Operator::Greater, 100.0));

    c.bench_function("single_condition", |b| {
        b.iter(|| {
            let mut report = report.clone();
            black_box(condition.select(&mut report, "keywordId").unwrap())
        });
    });
}

fn benchmark_nested_groups(c: &mut Criterion) {
    let mut group = c.benchmark_group("nested_groups");
    let conditions = nested_group();
    for size in [1_000, 10_000, 100_000] {
        let report = create_keyword_report(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &report, |b, report| {
            b.iter(|| {
                let mut report = report.clone();
                conditions.filter_data(&mut report, "keywordId").unwrap();
                black_box(report.num_rows())
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_kpi_derivation,
    benchmark_single_condition,
    benchmark_nested_groups
);
criterion_main!(benches);
