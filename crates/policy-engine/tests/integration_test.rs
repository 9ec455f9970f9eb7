//! 策略引擎集成测试
//!
//! 测试完整的扩展注册、规则加载、事件求值和持久化工作流。

use parking_lot::Mutex;
use policy_engine::parser::{parse_rule, render_calls};
use policy_engine::store::{RULES_PATH, rule_path, variable_path};
use policy_engine::{
    FileStore, MemoryStore, PolicyContext, PolicyError, PolicyStore, RuleText, Value, action_fn,
    check_fn,
};
use std::sync::Arc;

/// 记录所有动作调用 `name(args)`
type CallLog = Arc<Mutex<Vec<String>>>;

/// 创建测试上下文：电池、底座、电源键三个事件
fn create_context(store: Arc<dyn PolicyStore>) -> (PolicyContext, CallLog) {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = PolicyContext::new(store);
    let registry = ctx.registry_mut();

    let batt = registry
        .register_event("batt", false, Value::Int(100))
        .unwrap();
    let dock = registry
        .register_event("dock", false, Value::Bool(true))
        .unwrap();
    let key = registry
        .register_event("powerKey", true, Value::Bool(false))
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
        .register_condition_type(
            "undocked",
            check_fn(|v, _| v.as_bool() == Some(false)),
            "n",
            "undocked()",
            dock,
        )
        .unwrap();
    registry
        .register_condition_type(
            "powerKeyPressed",
            check_fn(|v, _| v.as_bool() == Some(true)),
            "n",
            "powerKeyPressed()",
            key,
        )
        .unwrap();

    for (name, signature) in [("logString", "s"), ("setBrightness", "i"), ("suspend", "n")] {
        let sink = log.clone();
        registry
            .register_action_type(
                name,
                action_fn(move |args| {
                    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                    sink.lock().push(format!("{}({})", name, args.join(", ")));
                    Ok(())
                }),
                signature,
                &format!("{}({})", name, signature),
            )
            .unwrap();
    }

    (ctx, log)
}

fn drain(log: &CallLog) -> Vec<String> {
    std::mem::take(&mut *log.lock())
}

#[test]
fn test_low_battery_end_to_end() {
    let (mut ctx, log) = create_context(Arc::new(MemoryStore::new()));

    let report = ctx.load_policy_text(r#"lowbatt | battLessThan(50) | logString("low")"#);
    assert!(report.is_clean());
    ctx.evaluate_all();

    let evaluation = ctx.set_event_value("batt", Value::Int(40)).unwrap();
    assert_eq!(evaluation.activated, vec!["lowbatt"]);
    assert_eq!(drain(&log), vec![r#"logString("low")"#]);
    assert!(ctx.rule("lowbatt").unwrap().active);

    let evaluation = ctx.set_event_value("batt", Value::Int(60)).unwrap();
    assert_eq!(evaluation.deactivated, vec!["lowbatt"]);
    assert!(drain(&log).is_empty());
    assert!(!ctx.rule("lowbatt").unwrap().active);
}

#[test]
fn test_dim_on_undock_with_undo() {
    let (mut ctx, log) = create_context(Arc::new(MemoryStore::new()));
    ctx.load_policy_text(
        r#"
        var dim(30)
        dim | battLessThan(50) undocked() | setBrightness($dim) logString("dimmed") | setBrightness(100)
        "#,
    );
    ctx.evaluate_all();

    ctx.set_event_value("batt", Value::Int(45)).unwrap();
    assert!(drain(&log).is_empty());

    ctx.set_event_value("dock", Value::Bool(false)).unwrap();
    assert_eq!(
        drain(&log),
        vec!["setBrightness(30)", r#"logString("dimmed")"#]
    );

    // 任一条件恢复即执行撤销动作，且只执行一次
    ctx.set_event_value("batt", Value::Int(80)).unwrap();
    ctx.set_event_value("dock", Value::Bool(true)).unwrap();
    assert_eq!(drain(&log), vec!["setBrightness(100)"]);
}

#[test]
fn test_rule_added_while_another_condition_already_holds() {
    let (mut ctx, log) = create_context(Arc::new(MemoryStore::new()));
    ctx.set_event_value("dock", Value::Bool(false)).unwrap();

    ctx.add_rule(&RuleText::new(
        "dim",
        "battLessThan(50) undocked()",
        "setBrightness(30)",
        "setBrightness(100)",
    ))
    .unwrap();
    ctx.load_policy_text(r#"warn | battLessThan(50) undocked() | logString("warn")"#);
    assert!(drain(&log).is_empty());

    let evaluation = ctx.set_event_value("batt", Value::Int(40)).unwrap();
    assert_eq!(evaluation.activated, vec!["dim", "warn"]);
    assert_eq!(
        drain(&log),
        vec!["setBrightness(30)", r#"logString("warn")"#]
    );
    assert!(ctx.rule("dim").unwrap().active);
}

#[test]
fn test_power_key_pulses() {
    let (mut ctx, log) = create_context(Arc::new(MemoryStore::new()));
    ctx.load_policy_text("sleep | powerKeyPressed() | suspend()");
    ctx.evaluate_all();

    for _ in 0..5 {
        ctx.set_event_value("powerKey", Value::Bool(true)).unwrap();
    }
    assert_eq!(drain(&log).len(), 5);
}

#[test]
fn test_variable_lifecycle() {
    let (mut ctx, _) = create_context(Arc::new(MemoryStore::new()));

    ctx.variables_mut()
        .add_or_overwrite("v", Value::Int(5))
        .unwrap();
    assert_eq!(
        ctx.variables_mut().lookup("v").unwrap().value,
        Value::Int(5)
    );

    let err = ctx
        .variables_mut()
        .add_or_overwrite("v", Value::from("x"))
        .unwrap_err();
    assert_eq!(err.code(), "VARIABLE_TYPE_MISMATCH");
    assert_eq!(ctx.variables_mut().resolve("v"), Some(Value::Int(5)));

    ctx.add_rule(&RuleText::new(
        "uses_v",
        "battLessThan($v)",
        "logString(\"x\")",
        "",
    ))
    .unwrap();
    assert!(matches!(
        ctx.delete_variable("v").unwrap_err(),
        PolicyError::VariableInUse { refs: 1, .. }
    ));

    ctx.delete_rule("uses_v").unwrap();
    ctx.delete_variable("v").unwrap();
    assert!(ctx.variables_mut().lookup("v").is_none());
}

#[test]
fn test_full_evaluation_twice_is_silent() {
    let (mut ctx, log) = create_context(Arc::new(MemoryStore::new()));
    ctx.load_policy_text(
        r#"
        always | battLessThan(101) | logString("on") | logString("off")
        never | battLessThan(0) | logString("never")
        "#,
    );

    ctx.evaluate_all();
    assert_eq!(drain(&log), vec![r#"logString("on")"#]);

    ctx.evaluate_all();
    assert!(drain(&log).is_empty());
}

#[test]
fn test_rule_text_round_trip() {
    let (mut ctx, _) = create_context(Arc::new(MemoryStore::new()));
    let original = RuleText::new(
        "mixed",
        r#"battLessThan(-5)  !undocked()"#,
        r#"logString("a, (b) | c") setBrightness($level)"#,
        "suspend()",
    );
    ctx.add_rule(&original).unwrap();

    let rendered = ctx.rule("mixed").unwrap().to_text();
    let reparsed = parse_rule(&rendered).unwrap();
    let parsed = parse_rule(&original).unwrap();

    assert_eq!(reparsed, parsed);
    assert_eq!(render_calls(&reparsed.conditions), rendered.conditions);
    assert_eq!(rendered.conditions, "battLessThan(-5) !undocked()");
}

#[test]
fn test_restart_restores_rules_and_variables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy-store.json");

    {
        let store = Arc::new(FileStore::open(&path).unwrap());
        let (mut ctx, _) = create_context(store);
        let report = ctx.load_policy_text(
            r#"
            var limit(20)
            critical | battLessThan($limit) | suspend()
            "#,
        );
        assert!(report.is_clean());
    }

    let store = Arc::new(FileStore::open(&path).unwrap());
    assert_eq!(
        store.read(&variable_path("limit")).unwrap(),
        Some("20".to_string())
    );
    assert!(store.dump(&rule_path("critical")).unwrap().is_object());

    let (mut ctx, log) = create_context(store.clone());
    let report = ctx.reload().unwrap();
    assert_eq!(report.rules_added, vec!["critical"]);

    ctx.set_event_value("batt", Value::Int(10)).unwrap();
    assert_eq!(drain(&log), vec!["suspend()"]);

    ctx.delete_rule("critical").unwrap();
    assert_eq!(store.dump(RULES_PATH).unwrap(), serde_json::json!({}));
}

#[test]
fn test_batch_keeps_going_after_bad_rules() {
    let (mut ctx, _) = create_context(Arc::new(MemoryStore::new()));
    let report = ctx.load_policy_text(
        r#"
        | battLessThan(1) | suspend()
        noconds | unknown() | suspend()
        noacts | battLessThan(1)
        badproto | battLessThan("low") | suspend()
        ok | battLessThan(1) | suspend()
        ok | battLessThan(2) | suspend()
        "#,
    );

    assert_eq!(report.rules_added, vec!["ok"]);
    let codes: Vec<_> = report.failures.iter().map(|f| f.error.code()).collect();
    assert_eq!(
        codes,
        vec![
            "EMPTY_NAME",
            "NO_CONDITIONS",
            "NO_ACTIONS",
            "BAD_PROTO",
            "DUPLICATE_RULE"
        ]
    );
}
