//! 策略引擎错误类型

use thiserror::Error;

use crate::parser::ParseMode;

#[derive(Debug, Error)]
pub enum PolicyError {
    // ==================== 解析错误 ====================
    #[error("{mode}解析失败: 位置 {position} 期望 {expected}, 实际 {found}")]
    Parse {
        mode: ParseMode,
        position: usize,
        found: String,
        expected: &'static str,
    },

    #[error("无效的数字字面量: {0}")]
    InvalidNumber(String),

    // ==================== 类型错误 ====================
    #[error("无效的布尔字面量: {0}")]
    BadBoolean(String),

    #[error("无法解析变量引用: ${0}")]
    UnresolvedVariable(String),

    #[error("变量 {name} 类型冲突: 已定义为 {existing}, 新值为 {requested}")]
    VariableTypeMismatch {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("值无法按字面量语法保存: {0}")]
    UnrepresentableValue(String),

    #[error("变量定义 {0} 只能包含一个值")]
    MultipleValues(String),

    #[error("变量定义 {0} 缺少值")]
    MissingValue(String),

    #[error("事件 {event} 的值类型为 {expected}, 实际 {actual}")]
    EventTypeMismatch {
        event: String,
        expected: String,
        actual: String,
    },

    // ==================== 规则校验错误 ====================
    #[error("规则名称不能为空")]
    EmptyName,

    #[error("无效的名称: {0}")]
    InvalidName(String),

    #[error("规则 {0} 没有可用的条件")]
    NoConditions(String),

    #[error("规则 {0} 没有可用的动作或撤销动作")]
    NoActions(String),

    #[error("规则已存在: {0}")]
    DuplicateRule(String),

    #[error("{function} 参数不匹配: 期望 ({expected}), 实际 ({received})")]
    BadProto {
        function: String,
        expected: String,
        received: String,
    },

    // ==================== 可恢复错误 ====================
    #[error("未注册的{kind}类型: {name}")]
    UnknownFunction { kind: &'static str, name: String },

    // ==================== 查找错误 ====================
    #[error("事件未找到: {0}")]
    UnknownEvent(String),

    #[error("规则未找到: {0}")]
    RuleNotFound(String),

    #[error("变量未找到: {0}")]
    VariableNotFound(String),

    #[error("变量 {name} 仍被 {refs} 处规则参数引用")]
    VariableInUse { name: String, refs: usize },

    // ==================== 外部协作方错误 ====================
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),

    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

impl PolicyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "PARSE_ERROR",
            Self::InvalidNumber(_) => "INVALID_NUMBER",
            Self::BadBoolean(_) => "BAD_BOOLEAN",
            Self::UnresolvedVariable(_) => "UNRESOLVED_VARIABLE",
            Self::VariableTypeMismatch { .. } => "VARIABLE_TYPE_MISMATCH",
            Self::UnrepresentableValue(_) => "UNREPRESENTABLE_VALUE",
            Self::MultipleValues(_) => "MULTIPLE_VALUES",
            Self::MissingValue(_) => "MISSING_VALUE",
            Self::EventTypeMismatch { .. } => "EVENT_TYPE_MISMATCH",
            Self::EmptyName => "EMPTY_NAME",
            Self::InvalidName(_) => "INVALID_NAME",
            Self::NoConditions(_) => "NO_CONDITIONS",
            Self::NoActions(_) => "NO_ACTIONS",
            Self::DuplicateRule(_) => "DUPLICATE_RULE",
            Self::BadProto { .. } => "BAD_PROTO",
            Self::UnknownFunction { .. } => "UNKNOWN_FUNCTION",
            Self::UnknownEvent(_) => "UNKNOWN_EVENT",
            Self::RuleNotFound(_) => "RULE_NOT_FOUND",
            Self::VariableNotFound(_) => "VARIABLE_NOT_FOUND",
            Self::VariableInUse { .. } => "VARIABLE_IN_USE",
            Self::Store(_) => "STORE_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// 是否为可恢复错误（跳过出错条目后规则仍可构建）
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnknownFunction { .. })
    }

    /// 是否为规则校验失败
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyName
                | Self::InvalidName(_)
                | Self::NoConditions(_)
                | Self::NoActions(_)
                | Self::DuplicateRule(_)
                | Self::BadProto { .. }
        )
    }
}

/// 持久化存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("存储数据格式错误: {0}")]
    Format(#[from] serde_json::Error),

    #[error("存储不可用: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = PolicyError::BadProto {
            function: "battLessThan".to_string(),
            expected: "int".to_string(),
            received: "string".to_string(),
        };
        assert_eq!(err.code(), "BAD_PROTO");
        assert!(err.is_validation());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_recoverable() {
        let err = PolicyError::UnknownFunction {
            kind: "条件",
            name: "noSuchCondition".to_string(),
        };
        assert!(err.is_recoverable());
        assert!(!err.is_validation());
        assert!(err.to_string().contains("noSuchCondition"));
    }

    #[test]
    fn test_store_error_conversion() {
        let err: PolicyError = StoreError::Unavailable("offline".to_string()).into();
        assert_eq!(err.code(), "STORE_ERROR");
        assert!(err.to_string().contains("offline"));
    }

    #[test]
    fn test_bad_proto_message() {
        let err = PolicyError::BadProto {
            function: "logString".to_string(),
            expected: "int, string".to_string(),
            received: "bool".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "logString 参数不匹配: 期望 (int, string), 实际 (bool)"
        );
    }
}
