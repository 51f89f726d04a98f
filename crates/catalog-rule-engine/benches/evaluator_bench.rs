//! 过滤条件评估性能基准测试
//!
//! 针对 FilterSpec、LIKE 模式和属性解析的细粒度性能测试。

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rule_engine::evaluator::LikePattern;
use rule_engine::{
    AttributeMeta, AttributeResolver, CombineNode, ConditionNode, FilterSpec,
    InMemoryAttributeCatalog, Operator, PreparedTree, ProductRow,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::hint::black_box;

fn create_attributes(option_count: i64) -> InMemoryAttributeCatalog {
    let labels: Vec<(i64, String)> = (0..option_count)
        .map(|i| (i, format!("Brand {}", i)))
        .collect();
    let options: Vec<(i64, &str)> = labels.iter().map(|(id, l)| (*id, l.as_str())).collect();

    InMemoryAttributeCatalog::from_attributes([
        AttributeMeta::select("brand", &options),
        AttributeMeta::multiselect("color", &[(1, "Red"), (2, "Green"), (3, "Blue")]),
        AttributeMeta::numeric("price"),
        AttributeMeta::text("name"),
    ])
}

/// 标量比较基准
fn bench_scalar_specs(c: &mut Criterion) {
    let mut group = c.benchmark_group("scalar_specs");

    let field = json!(1000);
    let specs = [
        ("eq", FilterSpec::Eq(json!(500))),
        ("neq", FilterSpec::Neq(json!(500))),
        ("gt", FilterSpec::Gt(json!(500))),
        ("lteq", FilterSpec::Lteq(json!(500))),
        ("null", FilterSpec::Null),
    ];

    for (name, spec) in &specs {
        group.bench_function(*name, |b| b.iter(|| black_box(spec).matches(black_box(Some(&field)))));
    }

    let date = json!("2024-06-01 10:00:00");
    let after = FilterSpec::Gt(json!("2024-01-01"));
    group.bench_function("date_gt", |b| {
        b.iter(|| black_box(&after).matches(black_box(Some(&date))))
    });

    group.finish();
}

/// LIKE 模式基准
fn bench_like(c: &mut Criterion) {
    let mut group = c.benchmark_group("like");

    let text = json!("Stainless Steel Electric Kettle 1.7L");
    let spec = FilterSpec::Like(LikePattern::new("%kettle%"));
    group.bench_function("match", |b| b.iter(|| black_box(&spec).matches(black_box(Some(&text)))));

    group.bench_function("compile_pattern", |b| {
        b.iter(|| LikePattern::new(black_box("steel_%_kettle")))
    });

    group.finish();
}

/// 多选属性集合比较基准
fn bench_multiselect(c: &mut Criterion) {
    let mut group = c.benchmark_group("multiselect");

    let stored = json!("1,4,9,16,25,36");
    let wanted: BTreeSet<i64> = [9, 100].into_iter().collect();
    let any_of = FilterSpec::AnyOf(wanted.clone());
    let none_of = FilterSpec::NoneOf(wanted);

    group.bench_function("any_of", |b| b.iter(|| black_box(&any_of).matches(black_box(Some(&stored)))));
    group.bench_function("none_of", |b| b.iter(|| black_box(&none_of).matches(black_box(Some(&stored)))));

    group.finish();
}

/// IN 列表规模基准
fn bench_in_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_scaling");
    let field = json!(-1);

    for size in [10, 100, 1000] {
        let values: Vec<Value> = (0..size).map(|i| json!(i)).collect();
        let spec = FilterSpec::In(values);
        group.bench_with_input(BenchmarkId::from_parameter(size), &spec, |b, spec| {
            b.iter(|| spec.matches(black_box(Some(&field))))
        });
    }

    group.finish();
}

/// 选项标签解析基准（按选项数量）
fn bench_label_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("label_resolution");
    let condition = ConditionNode::new("brand", Operator::Eq, "Brand 7");

    for options in [10, 100, 1000] {
        let attributes = create_attributes(options);
        let resolver = AttributeResolver::new(&attributes);
        group.bench_with_input(BenchmarkId::from_parameter(options), &condition, |b, cond| {
            b.iter(|| resolver.resolve(black_box("root.conditions[0]"), cond))
        });
    }

    group.finish();
}

/// 预处理后的规则树逐行评估
fn bench_prepared_tree(c: &mut Criterion) {
    let attributes = create_attributes(50);
    let resolver = AttributeResolver::new(&attributes);
    let tree = CombineNode::all(vec![
        ConditionNode::new("brand", Operator::In, "Brand 1,Brand 2,Brand 3").into(),
        CombineNode::any(vec![
            ConditionNode::new("price", Operator::Lt, 100).into(),
            ConditionNode::new("color", Operator::Eq, "Red").into(),
        ])
        .into(),
        ConditionNode::new("name", Operator::Nlike, "%refurbished%").into(),
    ]);
    let prepared = PreparedTree::prepare(&tree, &resolver, None);

    let matching = ProductRow::new(1)
        .with_attribute("brand", 2)
        .with_attribute("price", 80)
        .with_attribute("name", "Kettle");
    let failing = ProductRow::new(2)
        .with_attribute("brand", 40)
        .with_attribute("price", 80)
        .with_attribute("name", "Kettle");

    let mut group = c.benchmark_group("prepared_tree");
    group.bench_function("prepare", |b| {
        b.iter(|| PreparedTree::prepare(black_box(&tree), &resolver, None))
    });
    group.bench_function("matches", |b| b.iter(|| prepared.matches(black_box(&matching))));
    group.bench_function("short_circuit", |b| b.iter(|| prepared.matches(black_box(&failing))));
    group.finish();
}

criterion_group!(
    benches,
    bench_scalar_specs,
    bench_like,
    bench_multiselect,
    bench_in_scaling,
    bench_label_resolution,
    bench_prepared_tree,
);

criterion_main!(benches);
