//! 扩展注册表
//!
//! 管理事件、条件类型和动作类型，按名称索引。扩展通过 [`Extension`] 向注册表
//! 注册自己提供的类型；注册是幂等的：
//!
//! - 同名事件再次注册时返回已有的事件编号，事件当前值保持不变
//! - 同名条件/动作类型再次注册时替换原有描述
//!
//! ## 使用示例
//!
//! ```ignore
//! let mut registry = Registry::new();
//! let batt = registry.register_event("batt", false, Value::Int(100))?;
//! registry.register_condition_type(
//!     "battLessThan",
//!     check_fn(|value, args| value.as_int() < args[0].as_int()),
//!     "i",
//!     "battLessThan(percent)",
//!     batt,
//! )?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{PolicyError, Result};
use crate::model::{ActionFn, ActionType, CheckFn, ConditionType, Event, EventId};
use crate::parser::is_identifier;
use crate::value::{Signature, Value};

/// 扩展：一组事件、条件类型和动作类型的提供方
pub trait Extension: Send + Sync {
    /// 扩展名称
    fn name(&self) -> &str;

    /// 向注册表注册类型
    fn register(&self, registry: &mut Registry) -> Result<()>;
}

/// 事件与类型注册表
#[derive(Debug, Default)]
pub struct Registry {
    events: Vec<Event>,
    event_index: HashMap<String, EventId>,
    conditions: HashMap<String, Arc<ConditionType>>,
    actions: HashMap<String, Arc<ActionType>>,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PolicyError::EmptyName);
    }
    if !is_identifier(name) {
        return Err(PolicyError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册事件
    ///
    /// 事件的值类型由复位值决定。同名事件已存在时返回原编号。
    pub fn register_event(
        &mut self,
        name: &str,
        stateless: bool,
        reset_value: Value,
    ) -> Result<EventId> {
        check_name(name)?;

        if let Some(&id) = self.event_index.get(name) {
            let existing = &self.events[id];
            if existing.value_type != reset_value.value_type() {
                return Err(PolicyError::EventTypeMismatch {
                    event: name.to_string(),
                    expected: existing.value_type.to_string(),
                    actual: reset_value.value_type().to_string(),
                });
            }
            debug!(event = %name, id, "事件已注册，复用原编号");
            return Ok(id);
        }

        reset_value.check_literal()?;
        let id = self.events.len();
        debug!(event = %name, id, stateless, value_type = %reset_value.value_type(), "注册事件");
        self.events.push(Event::new(name, stateless, reset_value));
        self.event_index.insert(name.to_string(), id);
        Ok(id)
    }

    /// 注册条件类型
    pub fn register_condition_type(
        &mut self,
        name: &str,
        check: CheckFn,
        signature: &str,
        pretty_signature: &str,
        event: EventId,
    ) -> Result<()> {
        check_name(name)?;
        if event >= self.events.len() {
            return Err(PolicyError::UnknownEvent(format!("#{}", event)));
        }
        let signature = Signature::parse(signature)?;

        debug!(
            condition = %name,
            event = %self.events[event].name,
            signature = %signature,
            "注册条件类型"
        );
        self.conditions.insert(
            name.to_string(),
            Arc::new(ConditionType {
                name: name.to_string(),
                check,
                signature,
                pretty_signature: pretty_signature.to_string(),
                event,
            }),
        );
        Ok(())
    }

    /// 注册动作类型
    pub fn register_action_type(
        &mut self,
        name: &str,
        action: ActionFn,
        signature: &str,
        pretty_signature: &str,
    ) -> Result<()> {
        check_name(name)?;
        let signature = Signature::parse(signature)?;

        debug!(action = %name, signature = %signature, "注册动作类型");
        self.actions.insert(
            name.to_string(),
            Arc::new(ActionType {
                name: name.to_string(),
                action,
                signature,
                pretty_signature: pretty_signature.to_string(),
            }),
        );
        Ok(())
    }

    /// 加载扩展
    pub fn load(&mut self, extension: &dyn Extension) -> Result<()> {
        extension.register(self)?;
        info!(
            extension = extension.name(),
            events = self.events.len(),
            conditions = self.conditions.len(),
            actions = self.actions.len(),
            "扩展已加载"
        );
        Ok(())
    }

    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(id)
    }

    pub fn event_id(&self, name: &str) -> Option<EventId> {
        self.event_index.get(name).copied()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn condition_type(&self, name: &str) -> Option<Arc<ConditionType>> {
        self.conditions.get(name).cloned()
    }

    pub fn action_type(&self, name: &str) -> Option<Arc<ActionType>> {
        self.actions.get(name).cloned()
    }

    /// 所有条件类型，按名称排序
    pub fn condition_types(&self) -> Vec<Arc<ConditionType>> {
        let mut types: Vec<_> = self.conditions.values().cloned().collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }

    /// 所有动作类型，按名称排序
    pub fn action_types(&self) -> Vec<Arc<ActionType>> {
        let mut types: Vec<_> = self.actions.values().cloned().collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }

    /// 设置事件当前值，类型必须与声明一致
    pub(crate) fn set_event_value(&mut self, id: EventId, value: Value) -> Result<()> {
        let event = self
            .events
            .get_mut(id)
            .ok_or_else(|| PolicyError::UnknownEvent(format!("#{}", id)))?;

        if event.value_type != value.value_type() {
            return Err(PolicyError::EventTypeMismatch {
                event: event.name.clone(),
                expected: event.value_type.to_string(),
                actual: value.value_type().to_string(),
            });
        }
        value.check_literal()?;
        event.value = value;
        Ok(())
    }

    /// 将事件恢复为复位值
    pub(crate) fn reset_event(&mut self, id: EventId) {
        if let Some(event) = self.events.get_mut(id) {
            event.value = event.reset_value.clone();
        }
    }
}
