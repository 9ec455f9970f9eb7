//! 策略求值
//!
//! - 全量求值：重算所有有状态事件的依赖条件，再检查每条规则的激活状态
//! - 增量求值：事件值变化后只重算该事件的依赖条件，只检查受影响的规则
//!
//! 规则从未激活变为激活时按顺序执行动作，从激活变为未激活时按顺序执行撤销动作。
//! 无状态事件在增量求值后立即复位，并且不更新规则的激活标记。

use tracing::{debug, info, instrument, warn};

use crate::context::PolicyContext;
use crate::error::{PolicyError, Result};
use crate::model::{ActionInstance, ConditionInstance, EventId};
use crate::registry::Registry;
use crate::value::{Argument, Value};
use crate::variables::VariableCache;

/// 一次求值中发生激活状态转换的规则
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// 执行了动作的规则
    pub activated: Vec<String>,
    /// 执行了撤销动作的规则
    pub deactivated: Vec<String>,
}

impl Evaluation {
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty() && self.deactivated.is_empty()
    }
}

/// 解析参数列表，变量不存在时返回 `None`
fn resolve_args(variables: &mut VariableCache, args: &[Argument]) -> Option<Vec<Value>> {
    args.iter()
        .map(|arg| match arg {
            Argument::Literal(value) => Some(value.clone()),
            Argument::Variable(name) => variables.resolve(name),
        })
        .collect()
}

/// 检查单个条件，结果已应用取反
fn check_condition(
    registry: &Registry,
    variables: &mut VariableCache,
    condition: &ConditionInstance,
) -> bool {
    check_predicate(registry, variables, condition) != condition.inverted
}

/// 条件谓词本身的结果
///
/// 类型未注册、变量无法解析或参数类型不符时视为不成立。
fn check_predicate(
    registry: &Registry,
    variables: &mut VariableCache,
    condition: &ConditionInstance,
) -> bool {
    let Some(ctype) = registry.condition_type(&condition.type_name) else {
        warn!(condition = %condition.type_name, "条件类型已不存在");
        return false;
    };
    let Some(event) = registry.event(ctype.event) else {
        return false;
    };
    let Some(values) = resolve_args(variables, &condition.args) else {
        warn!(condition = %condition.type_name, "条件参数引用了未定义的变量");
        return false;
    };
    if let Err(e) = ctype.signature.check(&ctype.name, &values) {
        warn!(condition = %condition.type_name, error = %e, "条件参数类型不匹配");
        return false;
    }
    (ctype.check)(&event.value, &values)
}

/// 按顺序执行动作列表，单个动作失败不影响后续动作
fn fire_actions(
    registry: &Registry,
    variables: &mut VariableCache,
    rule_id: &str,
    actions: &[ActionInstance],
) -> usize {
    let mut fired = 0;
    for action in actions {
        let Some(atype) = registry.action_type(&action.type_name) else {
            warn!(rule_id = %rule_id, action = %action.type_name, "动作类型已不存在，跳过");
            continue;
        };
        let Some(values) = resolve_args(variables, &action.args) else {
            warn!(rule_id = %rule_id, action = %action.type_name, "动作参数引用了未定义的变量，跳过");
            continue;
        };
        if let Err(e) = atype.signature.check(&atype.name, &values) {
            warn!(rule_id = %rule_id, error = %e, "动作参数类型不匹配，跳过");
            continue;
        }

        debug!(rule_id = %rule_id, action = %action.type_name, "执行动作");
        match (atype.action)(&values) {
            Ok(()) => fired += 1,
            Err(e) => warn!(rule_id = %rule_id, action = %action.type_name, error = %e, "动作执行失败"),
        }
    }
    fired
}

impl PolicyContext {
    /// 规则激活状态转换：执行动作或撤销动作
    ///
    /// `latch` 为 false 时不更新激活标记（无状态事件触发）。
    fn transition(&mut self, index: usize, latch: bool, evaluation: &mut Evaluation) {
        let rule = &self.rules[index];
        let holds = rule.conditions_hold();

        if holds && !rule.active {
            let fired = fire_actions(&self.registry, &mut self.variables, &rule.id, &rule.actions);
            info!(rule_id = %rule.id, fired, "规则已激活");
            evaluation.activated.push(rule.id.clone());
        } else if !holds && rule.active {
            let fired = fire_actions(&self.registry, &mut self.variables, &rule.id, &rule.undos);
            info!(rule_id = %rule.id, fired, "规则已解除");
            evaluation.deactivated.push(rule.id.clone());
        }

        if latch {
            self.rules[index].active = holds;
        }
    }

    fn recompute_condition(&mut self, rule: usize, condition: usize) -> bool {
        let result = check_condition(
            &self.registry,
            &mut self.variables,
            &self.rules[rule].conditions[condition],
        );
        let slot = &mut self.rules[rule].conditions[condition].result;
        let changed = *slot != result;
        *slot = result;
        changed
    }

    /// 按当前事件值重算一条规则的全部条件，不触发动作
    pub(crate) fn refresh_conditions(&mut self, index: usize) {
        for c in 0..self.rules[index].conditions.len() {
            self.recompute_condition(index, c);
        }
    }

    /// 全量求值
    ///
    /// 只重算有状态事件的依赖条件；无状态事件的条件保持上次结果。
    #[instrument(skip(self))]
    pub fn evaluate_all(&mut self) -> Evaluation {
        for r in 0..self.rules.len() {
            for c in 0..self.rules[r].conditions.len() {
                let event = self.rules[r].conditions[c].event;
                let stateless = self.registry.event(event).is_some_and(|e| e.stateless);
                if !stateless {
                    self.recompute_condition(r, c);
                }
            }
        }

        let mut evaluation = Evaluation::default();
        for r in 0..self.rules.len() {
            self.transition(r, true, &mut evaluation);
        }

        debug!(
            activated = evaluation.activated.len(),
            deactivated = evaluation.deactivated.len(),
            "全量求值完成"
        );
        evaluation
    }

    /// 增量求值：事件值变化后调用
    #[instrument(skip(self))]
    pub fn evaluate_event(&mut self, event: EventId) -> Result<Evaluation> {
        let stateless = self
            .registry
            .event(event)
            .map(|e| e.stateless)
            .ok_or_else(|| PolicyError::UnknownEvent(format!("#{}", event)))?;
        let dependents = self.dependents.get(&event).cloned().unwrap_or_default();

        let mut changed_rules = Vec::new();
        for &(r, c) in &dependents {
            if self.recompute_condition(r, c) && !changed_rules.contains(&r) {
                changed_rules.push(r);
            }
        }
        changed_rules.sort_unstable();

        let mut evaluation = Evaluation::default();
        for &r in &changed_rules {
            self.transition(r, !stateless, &mut evaluation);
        }

        if stateless {
            self.registry.reset_event(event);
            for &(r, c) in &dependents {
                self.recompute_condition(r, c);
            }
        }

        Ok(evaluation)
    }

    /// 设置事件值并执行增量求值
    #[instrument(skip_all, fields(event = %name, value = %value))]
    pub fn set_event_value(&mut self, name: &str, value: Value) -> Result<Evaluation> {
        let id = self.event_id(name)?;
        self.registry.set_event_value(id, value)?;
        self.evaluate_event(id)
    }

    /// 单条规则求值：重算全部条件后检查激活状态
    #[instrument(skip(self))]
    pub fn evaluate_rule(&mut self, id: &str) -> Result<Evaluation> {
        let index = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| PolicyError::RuleNotFound(id.to_string()))?;

        self.refresh_conditions(index);

        let mut evaluation = Evaluation::default();
        self.transition(index, true, &mut evaluation);
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{action_fn, check_fn};
    use crate::parser::RuleText;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// 记录动作调用的上下文
    fn context() -> (PolicyContext, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = PolicyContext::new(Arc::new(MemoryStore::new()));
        let registry = ctx.registry_mut();

        let batt = registry.register_event("batt", false, Value::Int(100)).unwrap();
        let dock = registry.register_event("dock", false, Value::Bool(true)).unwrap();
        let key = registry.register_event("powerKey", true, Value::Bool(false)).unwrap();

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
                "docked",
                check_fn(|v, _| v.as_bool() == Some(true)),
                "n",
                "docked()",
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

        let sink = log.clone();
        registry
            .register_action_type(
                "record",
                action_fn(move |args| {
                    sink.lock().push(args[0].as_str().unwrap_or_default().to_string());
                    Ok(())
                }),
                "s",
                "record(msg)",
            )
            .unwrap();
        registry
            .register_action_type(
                "fail",
                action_fn(|_| anyhow::bail!("硬件不可用")),
                "n",
                "fail()",
            )
            .unwrap();

        (ctx, log)
    }

    fn take(log: &Mutex<Vec<String>>) -> Vec<String> {
        std::mem::take(&mut *log.lock())
    }

    #[test]
    fn test_two_conditions_activate_together() {
        let (mut ctx, log) = context();
        ctx.add_rule(&RuleText::new(
            "dim",
            "battLessThan(50) !docked()",
            "record(\"a\") record(\"b\")",
            "record(\"undo\")",
        ))
        .unwrap();
        ctx.evaluate_all();
        assert!(take(&log).is_empty());

        ctx.set_event_value("batt", Value::Int(40)).unwrap();
        assert!(take(&log).is_empty());
        assert!(!ctx.rule("dim").unwrap().active);

        let evaluation = ctx.set_event_value("dock", Value::Bool(false)).unwrap();
        assert_eq!(evaluation.activated, vec!["dim"]);
        assert_eq!(take(&log), vec!["a", "b"]);
        assert!(ctx.rule("dim").unwrap().active);

        // 已激活时再次满足不重复执行
        ctx.set_event_value("batt", Value::Int(30)).unwrap();
        assert!(take(&log).is_empty());

        let evaluation = ctx.set_event_value("dock", Value::Bool(true)).unwrap();
        assert_eq!(evaluation.deactivated, vec!["dim"]);
        assert_eq!(take(&log), vec!["undo"]);
        assert!(!ctx.rule("dim").unwrap().active);
    }

    #[test]
    fn test_stateless_event_fires_every_occurrence() {
        let (mut ctx, log) = context();
        ctx.add_rule(&RuleText::new("key", "powerKeyPressed()", "record(\"press\")", "record(\"release\")"))
            .unwrap();
        ctx.evaluate_all();

        for _ in 0..3 {
            ctx.set_event_value("powerKey", Value::Bool(true)).unwrap();
            let rule = ctx.rule("key").unwrap();
            assert!(!rule.active);
            assert!(!rule.conditions[0].result);
        }

        assert_eq!(take(&log), vec!["press", "press", "press"]);
        assert_eq!(
            ctx.registry().event(ctx.event_id("powerKey").unwrap()).unwrap().value,
            Value::Bool(false)
        );
    }

    #[test]
    fn test_full_evaluation_idempotent() {
        let (mut ctx, log) = context();
        ctx.add_rule(&RuleText::new("full", "battLessThan(200)", "record(\"on\")", ""))
            .unwrap();

        let first = ctx.evaluate_all();
        assert_eq!(first.activated, vec!["full"]);
        let second = ctx.evaluate_all();
        assert!(second.is_empty());
        assert_eq!(take(&log), vec!["on"]);
    }

    #[test]
    fn test_full_evaluation_skips_stateless_conditions() {
        let (mut ctx, _) = context();
        ctx.add_rule(&RuleText::new("key", "!powerKeyPressed()", "record(\"x\")", ""))
            .unwrap();

        // 添加时按复位值计算
        assert!(ctx.rule("key").unwrap().conditions[0].result);

        // 全量求值不重算无状态事件的条件
        ctx.rules[0].conditions[0].result = false;
        ctx.evaluate_all();
        assert!(!ctx.rule("key").unwrap().conditions[0].result);
        assert!(!ctx.rule("key").unwrap().active);

        ctx.evaluate_rule("key").unwrap();
        assert!(ctx.rule("key").unwrap().active);
    }

    #[test]
    fn test_variable_argument_resolved_at_evaluation() {
        let (mut ctx, log) = context();
        ctx.add_rule(&RuleText::new("low", "battLessThan($limit)", "record($msg)", ""))
            .unwrap();
        ctx.set_event_value("batt", Value::Int(10)).unwrap();
        // 变量未定义：条件不成立
        assert!(!ctx.rule("low").unwrap().active);

        ctx.define_variable("limit(50)").unwrap();
        ctx.define_variable("msg(\"low\")").unwrap();
        ctx.set_event_value("batt", Value::Int(11)).unwrap();
        assert!(ctx.rule("low").unwrap().active);
        assert_eq!(take(&log), vec!["low"]);
    }

    #[test]
    fn test_mistyped_variable_makes_condition_false() {
        let (mut ctx, _) = context();
        ctx.add_rule(&RuleText::new("low", "battLessThan($limit)", "record(\"x\")", ""))
            .unwrap();
        ctx.define_variable("limit(t)").unwrap();

        ctx.set_event_value("batt", Value::Int(1)).unwrap();
        assert!(!ctx.rule("low").unwrap().active);
    }

    #[test]
    fn test_failing_action_does_not_stop_list() {
        let (mut ctx, log) = context();
        ctx.add_rule(&RuleText::new("r", "battLessThan(50)", "fail() record(\"after\")", ""))
            .unwrap();

        let evaluation = ctx.set_event_value("batt", Value::Int(10)).unwrap();
        assert_eq!(evaluation.activated, vec!["r"]);
        assert_eq!(take(&log), vec!["after"]);
    }

    #[test]
    fn test_event_type_checked() {
        let (mut ctx, _) = context();
        assert!(matches!(
            ctx.set_event_value("batt", Value::from("low")).unwrap_err(),
            PolicyError::EventTypeMismatch { .. }
        ));
        assert!(matches!(
            ctx.set_event_value("lid", Value::Bool(true)).unwrap_err(),
            PolicyError::UnknownEvent(_)
        ));
    }

    #[test]
    fn test_evaluate_rule_after_add() {
        let (mut ctx, log) = context();
        ctx.set_event_value("batt", Value::Int(20)).unwrap();
        ctx.add_rule(&RuleText::new("late", "battLessThan(50)", "record(\"late\")", ""))
            .unwrap();

        assert_eq!(ctx.evaluate_rule("late").unwrap().activated, vec!["late"]);
        assert_eq!(take(&log), vec!["late"]);
        assert!(ctx.evaluate_rule("missing").is_err());
    }

    #[test]
    fn test_unaffected_rules_not_touched() {
        let (mut ctx, log) = context();
        ctx.add_rule(&RuleText::new("a", "battLessThan(50)", "record(\"a\")", ""))
            .unwrap();
        ctx.add_rule(&RuleText::new("b", "docked()", "record(\"b\")", ""))
            .unwrap();

        ctx.set_event_value("batt", Value::Int(10)).unwrap();
        assert_eq!(take(&log), vec!["a"]);
        assert!(!ctx.rule("b").unwrap().active);
    }
}
