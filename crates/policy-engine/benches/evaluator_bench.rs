//! 策略引擎性能基准测试
//!
//! 覆盖规则文本解析和事件驱动的增量求值。

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use policy_engine::parser::{parse_argument, parse_conditions};
use policy_engine::{MemoryStore, PolicyContext, RuleText, Value, action_fn, check_fn};
use std::hint::black_box;
use std::sync::Arc;

/// 创建包含 `rules` 条规则的上下文，所有规则都依赖 `batt` 事件
fn create_context(rules: usize) -> PolicyContext {
    let mut ctx = PolicyContext::new(Arc::new(MemoryStore::new()));
    let registry = ctx.registry_mut();
    let batt = registry
        .register_event("batt", false, Value::Int(100))
        .unwrap();
    registry
        .register_condition_type(
            "battLessThan",
            check_fn(|v, args| v.as_int() < args[0].as_int()),
            "i",
            "battLessThan(percent)",
            batt,
        )
        .unwrap();
    registry
        .register_action_type("noop", action_fn(|_| Ok(())), "i", "noop(n)")
        .unwrap();

    for i in 0..rules {
        let threshold = (i % 100) as i64;
        ctx.add_rule(&RuleText::new(
            format!("rule_{}", i),
            format!("battLessThan({})", threshold),
            format!("noop({})", i),
            format!("noop(-{})", i),
        ))
        .unwrap();
    }
    ctx.evaluate_all();
    ctx
}

/// 解析基准
fn bench_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser");

    let conditions = r#"battLessThan(50) !lidClosed() powerSource("ac", 1.5, t, $limit)"#;
    group.bench_function("condition_list", |b| {
        b.iter(|| parse_conditions(black_box(conditions)))
    });

    group.bench_function("argument_literal", |b| {
        b.iter(|| parse_argument(black_box("-12345.678")))
    });

    group.finish();
}

/// 增量求值基准：事件值在阈值两侧交替
fn bench_incremental(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_evaluation");

    for rules in [10usize, 100, 1000] {
        let mut ctx = create_context(rules);
        let mut low = false;

        group.bench_with_input(BenchmarkId::from_parameter(rules), &rules, |b, _| {
            b.iter(|| {
                low = !low;
                let value = if low { 10 } else { 90 };
                ctx.set_event_value(black_box("batt"), Value::Int(value))
            })
        });
    }

    group.finish();
}

/// 全量求值基准：无状态变化时的开销
fn bench_full(c: &mut Criterion) {
    let mut ctx = create_context(1000);
    c.bench_function("full_evaluation_1000_rules", |b| {
        b.iter(|| black_box(ctx.evaluate_all()))
    });
}

criterion_group!(benches, bench_parser, bench_incremental, bench_full);
criterion_main!(benches);
