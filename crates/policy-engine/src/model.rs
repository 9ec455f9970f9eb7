//! 事件、条件、动作与规则模型
//!
//! 条件和动作实例按值存放在所属规则内，只记录类型名称和绑定的事件编号；
//! 变量引用参数只保存变量名，在求值时通过变量缓存解析。

use crate::error::Result;
use crate::parser::{FnCall, RuleText, is_identifier, parse_argument, render_calls};
use crate::value::{Argument, Signature, Value, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 事件编号，注册时分配，进程生命周期内不变
pub type EventId = usize;

/// 条件检查函数：事件当前值 + 已解析的参数
pub type CheckFn = Arc<dyn Fn(&Value, &[Value]) -> bool + Send + Sync>;

/// 动作函数
pub type ActionFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<()> + Send + Sync>;

pub fn check_fn<F>(f: F) -> CheckFn
where
    F: Fn(&Value, &[Value]) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn action_fn<F>(f: F) -> ActionFn
where
    F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 可观测的命名信号
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    /// 无状态事件在每次求值后复位
    pub stateless: bool,
    pub value_type: ValueType,
    pub reset_value: Value,
    pub value: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, stateless: bool, reset_value: Value) -> Self {
        Self {
            name: name.into(),
            stateless,
            value_type: reset_value.value_type(),
            value: reset_value.clone(),
            reset_value,
        }
    }
}

/// 条件类型：绑定到一个事件的命名谓词
pub struct ConditionType {
    pub name: String,
    pub check: CheckFn,
    pub signature: Signature,
    pub pretty_signature: String,
    pub event: EventId,
}

impl fmt::Debug for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionType")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("pretty_signature", &self.pretty_signature)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// 动作类型
pub struct ActionType {
    pub name: String,
    pub action: ActionFn,
    pub signature: Signature,
    pub pretty_signature: String,
}

impl fmt::Debug for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionType")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("pretty_signature", &self.pretty_signature)
            .finish_non_exhaustive()
    }
}

/// 规则内的一个条件
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionInstance {
    pub type_name: String,
    pub event: EventId,
    pub inverted: bool,
    pub args: Vec<Argument>,
    /// 最近一次检查结果（已应用取反）
    pub result: bool,
}

impl ConditionInstance {
    pub fn to_call(&self) -> FnCall {
        FnCall {
            name: self.type_name.clone(),
            inverted: self.inverted,
            args: self.args.clone(),
        }
    }
}

/// 规则内的一个动作或撤销动作
#[derive(Debug, Clone, PartialEq)]
pub struct ActionInstance {
    pub type_name: String,
    pub args: Vec<Argument>,
}

impl ActionInstance {
    pub fn to_call(&self) -> FnCall {
        FnCall::new(self.type_name.clone(), self.args.clone())
    }
}

/// 规则
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    pub conditions: Vec<ConditionInstance>,
    pub actions: Vec<ActionInstance>,
    pub undos: Vec<ActionInstance>,
    pub active: bool,
}

impl Rule {
    /// 所有条件的当前结果取与
    pub fn conditions_hold(&self) -> bool {
        self.conditions.iter().all(|c| c.result)
    }

    /// 规则引用的变量名（含重复）
    pub fn variable_refs(&self) -> impl Iterator<Item = &str> {
        let conditions = self.conditions.iter().flat_map(|c| c.args.iter());
        let actions = self
            .actions
            .iter()
            .chain(self.undos.iter())
            .flat_map(|a| a.args.iter());
        conditions
            .chain(actions)
            .filter_map(Argument::variable_name)
    }

    /// 渲染回四段文本形式
    pub fn to_text(&self) -> RuleText {
        let conditions: Vec<FnCall> = self.conditions.iter().map(|c| c.to_call()).collect();
        let actions: Vec<FnCall> = self.actions.iter().map(|a| a.to_call()).collect();
        let undos: Vec<FnCall> = self.undos.iter().map(|a| a.to_call()).collect();

        RuleText {
            name: self.id.clone(),
            conditions: render_calls(&conditions),
            actions: render_calls(&actions),
            undos: render_calls(&undos),
        }
    }

    /// 持久化 JSON 形式
    pub fn to_persisted(&self) -> PersistedRule {
        PersistedRule {
            conditions: self
                .conditions
                .iter()
                .map(|c| PersistedCall::from_call(&c.to_call(), true))
                .enumerate()
                .collect(),
            actions: self
                .actions
                .iter()
                .map(|a| PersistedCall::from_call(&a.to_call(), false))
                .enumerate()
                .collect(),
            undos: self
                .undos
                .iter()
                .map(|a| PersistedCall::from_call(&a.to_call(), false))
                .enumerate()
                .collect(),
        }
    }
}

/// 存储中的规则
///
/// ```json
/// {
///   "conditions": { "0": { "type": "battLessThan", "is_inverted": false, "args": { "0": "50" } } },
///   "actions":    { "0": { "type": "logString", "args": { "0": "\"low\"" } } },
///   "undos":      {}
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedRule {
    #[serde(default)]
    pub conditions: BTreeMap<usize, PersistedCall>,
    #[serde(default)]
    pub actions: BTreeMap<usize, PersistedCall>,
    #[serde(default)]
    pub undos: BTreeMap<usize, PersistedCall>,
}

impl PersistedRule {
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// 还原为文本形式，参数字面量逐个重新解析
    pub fn to_text(&self, id: &str) -> Result<RuleText> {
        let render = |calls: &BTreeMap<usize, PersistedCall>| -> Result<String> {
            let calls = calls
                .values()
                .map(PersistedCall::to_call)
                .collect::<Result<Vec<_>>>()?;
            Ok(render_calls(&calls))
        };

        Ok(RuleText {
            name: id.to_string(),
            conditions: render(&self.conditions)?,
            actions: render(&self.actions)?,
            undos: render(&self.undos)?,
        })
    }
}

/// 存储的规则 JSON 中出现的变量引用，每次出现计一次
///
/// 只看 `$name` 形式的字符串叶子，不要求 JSON 能还原为规则。
pub fn stored_variable_refs(json: &serde_json::Value) -> Vec<String> {
    fn collect(json: &serde_json::Value, refs: &mut Vec<String>) {
        match json {
            serde_json::Value::Object(map) => map.values().for_each(|v| collect(v, refs)),
            serde_json::Value::Array(items) => items.iter().for_each(|v| collect(v, refs)),
            serde_json::Value::String(s) => {
                if let Some(name) = s.strip_prefix('$').filter(|n| is_identifier(n)) {
                    refs.push(name.to_string());
                }
            }
            _ => {}
        }
    }

    let mut refs = Vec::new();
    collect(json, &mut refs);
    refs
}

/// 存储中的单个条件或动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCall {
    #[serde(rename = "type")]
    pub type_name: String,
    /// 仅条件携带
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_inverted: Option<bool>,
    #[serde(default)]
    pub args: BTreeMap<usize, String>,
}

impl PersistedCall {
    fn from_call(call: &FnCall, is_condition: bool) -> Self {
        Self {
            type_name: call.name.clone(),
            is_inverted: is_condition.then_some(call.inverted),
            args: call
                .args
                .iter()
                .map(|a| a.to_string())
                .enumerate()
                .collect(),
        }
    }

    fn to_call(&self) -> Result<FnCall> {
        let args = self
            .args
            .values()
            .map(|literal| parse_argument(literal))
            .collect::<Result<Vec<_>>>()?;

        Ok(FnCall {
            name: self.type_name.clone(),
            inverted: self.is_inverted.unwrap_or(false),
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_rule() -> Rule {
        Rule {
            id: "lowbatt".to_string(),
            conditions: vec![
                ConditionInstance {
                    type_name: "battLessThan".to_string(),
                    event: 0,
                    inverted: false,
                    args: vec![Argument::Variable("limit".to_string())],
                    result: true,
                },
                ConditionInstance {
                    type_name: "lidClosed".to_string(),
                    event: 1,
                    inverted: true,
                    args: vec![],
                    result: false,
                },
            ],
            actions: vec![ActionInstance {
                type_name: "logString".to_string(),
                args: vec![Argument::Literal(Value::from("low"))],
            }],
            undos: vec![ActionInstance {
                type_name: "logInt".to_string(),
                args: vec![
                    Argument::Literal(Value::Int(1)),
                    Argument::Variable("limit".to_string()),
                ],
            }],
            active: false,
        }
    }

    #[test]
    fn test_conditions_hold() {
        let mut rule = sample_rule();
        assert!(!rule.conditions_hold());
        rule.conditions[1].result = true;
        assert!(rule.conditions_hold());
    }

    #[test]
    fn test_variable_refs_counts_each_use() {
        let rule = sample_rule();
        let refs: Vec<_> = rule.variable_refs().collect();
        assert_eq!(refs, vec!["limit", "limit"]);
    }

    #[test]
    fn test_to_text() {
        let text = sample_rule().to_text();
        assert_eq!(text.name, "lowbatt");
        assert_eq!(text.conditions, "battLessThan($limit) !lidClosed()");
        assert_eq!(text.actions, "logString(\"low\")");
        assert_eq!(text.undos, "logInt(1, $limit)");
    }

    #[test]
    fn test_persisted_json_shape() {
        let json = sample_rule().to_persisted().to_json().unwrap();
        assert_eq!(
            json,
            json!({
                "conditions": {
                    "0": { "type": "battLessThan", "is_inverted": false, "args": { "0": "$limit" } },
                    "1": { "type": "lidClosed", "is_inverted": true, "args": {} }
                },
                "actions": {
                    "0": { "type": "logString", "args": { "0": "\"low\"" } }
                },
                "undos": {
                    "0": { "type": "logInt", "args": { "0": "1", "1": "$limit" } }
                }
            })
        );
    }

    #[test]
    fn test_persisted_to_text_matches_rule_text() {
        let rule = sample_rule();
        let json = rule.to_persisted().to_json().unwrap();
        let restored = PersistedRule::from_json(json).unwrap();
        assert_eq!(restored.to_text("lowbatt").unwrap(), rule.to_text());
    }

    #[test]
    fn test_persisted_missing_sections_default() {
        // 存储不保留空对象
        let restored = PersistedRule::from_json(json!({
            "conditions": { "0": { "type": "powerKeyPressed" } }
        }))
        .unwrap();

        let text = restored.to_text("r").unwrap();
        assert_eq!(text.conditions, "powerKeyPressed()");
        assert_eq!(text.actions, "");
        assert_eq!(text.undos, "");
    }

    #[test]
    fn test_persisted_orders_numeric_keys() {
        let restored = PersistedRule::from_json(json!({
            "actions": {
                "10": { "type": "k" },
                "2": { "type": "c" },
                "0": { "type": "a" }
            }
        }))
        .unwrap();
        assert_eq!(restored.to_text("r").unwrap().actions, "a() c() k()");
    }

    #[test]
    fn test_stored_variable_refs() {
        let json = sample_rule().to_persisted().to_json().unwrap();
        assert_eq!(stored_variable_refs(&json), vec!["limit", "limit"]);

        // 无法还原的规则也能取到引用
        let broken = json!({
            "conditions": { "0": { "args": { "0": "$limit", "1": "\"$notvar\"" } } }
        });
        assert_eq!(stored_variable_refs(&broken), vec!["limit"]);
    }

    #[test]
    fn test_event_new_starts_at_reset_value() {
        let event = Event::new("batt", false, Value::Int(100));
        assert_eq!(event.value, Value::Int(100));
        assert_eq!(event.value_type, ValueType::Int);
    }
}
