//! 电源策略引擎
//!
//! 以小型文本语言描述响应式电源管理策略，并在平台事件发生时执行：
//! - 表驱动状态机解析规则、变量定义和参数字面量
//! - 事件 / 条件 / 动作 / 规则模型与扩展注册表
//! - 带激活/撤销语义的增量求值
//! - 引用计数的变量缓存，写穿到持久化存储

pub mod builtin;
pub mod command;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod model;
pub mod parser;
pub mod registry;
pub mod store;
pub mod value;
pub mod variables;

pub use builtin::{LogExtension, ThresholdExtension};
pub use context::{BatchReport, BuildReport, PolicyContext, RuleSummary};
pub use error::{PolicyError, Result, StoreError};
pub use evaluator::Evaluation;
pub use model::{Event, EventId, Rule, action_fn, check_fn};
pub use parser::{FnCall, ParseMode, RuleText};
pub use registry::{Extension, Registry};
pub use store::{FileStore, MemoryStore, PolicyStore};
pub use value::{Argument, Value, ValueType};
