//! 内置扩展
//!
//! - [`LogExtension`]：把动作参数写入日志的动作类型
//! - [`ThresholdExtension`]：根据配置中声明的事件生成比较条件

use policy_shared::config::EventDeclaration;
use tracing::info;

use crate::error::{PolicyError, Result};
use crate::model::{action_fn, check_fn};
use crate::parser::parse_literal;
use crate::registry::{Extension, Registry};
use crate::value::{Value, ValueType};

/// 日志动作扩展
///
/// 注册 `logString(s)`、`logInt(i)`、`logBool(b)`。
#[derive(Debug, Default)]
pub struct LogExtension;

impl Extension for LogExtension {
    fn name(&self) -> &str {
        "log"
    }

    fn register(&self, registry: &mut Registry) -> Result<()> {
        registry.register_action_type(
            "logString",
            action_fn(|args| {
                info!(target: "policy_action", text = %args[0], "logString");
                Ok(())
            }),
            "s",
            "logString(message)",
        )?;
        registry.register_action_type(
            "logInt",
            action_fn(|args| {
                info!(target: "policy_action", value = %args[0], "logInt");
                Ok(())
            }),
            "i",
            "logInt(value)",
        )?;
        registry.register_action_type(
            "logBool",
            action_fn(|args| {
                info!(target: "policy_action", value = %args[0], "logBool");
                Ok(())
            }),
            "b",
            "logBool(value)",
        )?;
        Ok(())
    }
}

/// 已校验的事件声明
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdEvent {
    pub name: String,
    pub stateless: bool,
    pub reset_value: Value,
}

impl ThresholdEvent {
    /// 从配置声明构建；复位值按参数字面量解析，整数字面量可用于浮点事件
    pub fn from_declaration(declaration: &EventDeclaration) -> Result<Self> {
        let value_type: ValueType = declaration.value_type.parse()?;
        let reset_value = match (value_type, parse_literal(&declaration.reset_value)?) {
            (ValueType::Float, Value::Int(i)) => Value::Float(i as f64),
            (_, value) => value,
        };

        if reset_value.value_type() != value_type {
            return Err(PolicyError::EventTypeMismatch {
                event: declaration.name.clone(),
                expected: value_type.to_string(),
                actual: reset_value.value_type().to_string(),
            });
        }

        Ok(Self {
            name: declaration.name.clone(),
            stateless: declaration.stateless,
            reset_value,
        })
    }
}

/// 阈值条件扩展
///
/// 对每个声明的事件 `x` 注册：
///
/// | 事件类型 | 条件 |
/// |---|---|
/// | int | `xEquals(i)` `xLessThan(i)` `xGreaterThan(i)` |
/// | float | `xEquals(f)` `xLessThan(f)` `xGreaterThan(f)` |
/// | bool | `xIs(b)` |
/// | string | `xEquals(s)` |
#[derive(Debug, Default)]
pub struct ThresholdExtension {
    events: Vec<ThresholdEvent>,
}

impl ThresholdExtension {
    pub fn new(events: Vec<ThresholdEvent>) -> Self {
        Self { events }
    }

    pub fn from_declarations(declarations: &[EventDeclaration]) -> Result<Self> {
        let events = declarations
            .iter()
            .map(ThresholdEvent::from_declaration)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(events))
    }

    fn register_event(registry: &mut Registry, event: &ThresholdEvent) -> Result<()> {
        let id = registry.register_event(&event.name, event.stateless, event.reset_value.clone())?;
        let name = &event.name;

        match event.reset_value.value_type() {
            ValueType::Int => {
                registry.register_condition_type(
                    &format!("{name}Equals"),
                    check_fn(|v, args| v.as_int() == args[0].as_int()),
                    "i",
                    &format!("{name}Equals(value)"),
                    id,
                )?;
                registry.register_condition_type(
                    &format!("{name}LessThan"),
                    check_fn(|v, args| compare(v, &args[0], |a, b| a < b)),
                    "i",
                    &format!("{name}LessThan(value)"),
                    id,
                )?;
                registry.register_condition_type(
                    &format!("{name}GreaterThan"),
                    check_fn(|v, args| compare(v, &args[0], |a, b| a > b)),
                    "i",
                    &format!("{name}GreaterThan(value)"),
                    id,
                )?;
            }
            ValueType::Float => {
                registry.register_condition_type(
                    &format!("{name}Equals"),
                    check_fn(|v, args| compare(v, &args[0], |a, b| (a - b).abs() < f64::EPSILON)),
                    "f",
                    &format!("{name}Equals(value)"),
                    id,
                )?;
                registry.register_condition_type(
                    &format!("{name}LessThan"),
                    check_fn(|v, args| compare(v, &args[0], |a, b| a < b)),
                    "f",
                    &format!("{name}LessThan(value)"),
                    id,
                )?;
                registry.register_condition_type(
                    &format!("{name}GreaterThan"),
                    check_fn(|v, args| compare(v, &args[0], |a, b| a > b)),
                    "f",
                    &format!("{name}GreaterThan(value)"),
                    id,
                )?;
            }
            ValueType::Bool => {
                registry.register_condition_type(
                    &format!("{name}Is"),
                    check_fn(|v, args| v.as_bool().is_some() && v.as_bool() == args[0].as_bool()),
                    "b",
                    &format!("{name}Is(state)"),
                    id,
                )?;
            }
            ValueType::String => {
                registry.register_condition_type(
                    &format!("{name}Equals"),
                    check_fn(|v, args| v.as_str().is_some() && v.as_str() == args[0].as_str()),
                    "s",
                    &format!("{name}Equals(value)"),
                    id,
                )?;
            }
        }
        Ok(())
    }
}

/// 数值比较，整数和浮点数统一按浮点比较
fn compare(value: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (value.as_float(), expected.as_float()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

impl Extension for ThresholdExtension {
    fn name(&self) -> &str {
        "threshold"
    }

    fn register(&self, registry: &mut Registry) -> Result<()> {
        for event in &self.events {
            Self::register_event(registry, event)?;
        }
        Ok(())
    }
}
