//! 参数值与函数签名定义

use crate::error::{PolicyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Float,
    String,
    Bool,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ValueType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" | "i" => Ok(Self::Int),
            "float" | "f" => Ok(Self::Float),
            "string" | "s" => Ok(Self::String),
            "bool" | "b" => Ok(Self::Bool),
            other => Err(PolicyError::InvalidName(format!("值类型 '{}'", other))),
        }
    }
}

/// 类型化的字面量值
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
            Self::String(_) => ValueType::String,
            Self::Bool(_) => ValueType::Bool,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// 整数也可按浮点读取
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 检查值能否按字面量语法写出并原样解析回来
    ///
    /// 字符串字面量没有转义，不能包含 `"`；浮点数必须是有限值。
    pub fn check_literal(&self) -> Result<()> {
        let representable = match self {
            Self::String(s) => !s.contains('"'),
            Self::Float(f) => f.is_finite(),
            Self::Int(_) | Self::Bool(_) => true,
        };
        if representable {
            Ok(())
        } else {
            Err(PolicyError::UnrepresentableValue(format!("{:?}", self)))
        }
    }

    /// 按参数字面量语法序列化
    ///
    /// 字符串加双引号，浮点数总是带小数点，布尔值为 `t` / `f`。
    pub fn to_literal(&self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::Float(f) if f.fract() == 0.0 && f.is_finite() => format!("{:.1}", f),
            Self::Float(f) => f.to_string(),
            Self::String(s) => format!("\"{}\"", s),
            Self::Bool(true) => "t".to_string(),
            Self::Bool(false) => "f".to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_literal())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// 条件/动作实例携带的参数：字面量或按名称引用的变量
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Literal(Value),
    Variable(String),
}

impl Argument {
    pub fn variable_name(&self) -> Option<&str> {
        match self {
            Self::Variable(name) => Some(name),
            Self::Literal(_) => None,
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{}", v),
            Self::Variable(name) => write!(f, "${}", name),
        }
    }
}

/// 签名中单个参数位置的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Exact(ValueType),
    /// `v`：接受解析后任意类型的值
    Any,
}

impl ParamType {
    pub fn accepts(&self, actual: ValueType) -> bool {
        match self {
            Self::Exact(t) => *t == actual,
            Self::Any => true,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(t) => write!(f, "{}", t),
            Self::Any => write!(f, "variable"),
        }
    }
}

/// 参数签名（原型）
///
/// 由扩展以短字符串声明，每个字符对应一个参数：
/// `i`=int, `f`=float, `s`=string, `b`=bool, `v`=任意类型, `n`=无参数。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    params: Vec<ParamType>,
}

impl Signature {
    pub fn parse(text: &str) -> Result<Self> {
        if text == "n" {
            return Ok(Self::default());
        }

        let params = text
            .chars()
            .map(|c| match c {
                'i' => Ok(ParamType::Exact(ValueType::Int)),
                'f' => Ok(ParamType::Exact(ValueType::Float)),
                's' => Ok(ParamType::Exact(ValueType::String)),
                'b' => Ok(ParamType::Exact(ValueType::Bool)),
                'v' => Ok(ParamType::Any),
                other => Err(PolicyError::InvalidName(format!(
                    "签名 '{}' 中的类型字符 '{}'",
                    text, other
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { params })
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// 人类可读形式，如 `int, string`
    pub fn describe(&self) -> String {
        if self.params.is_empty() {
            return "none".to_string();
        }
        self.params
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// 校验参数位置；`None` 表示该位置尚无法解析，跳过类型比较
    pub fn check_partial(&self, function: &str, actual: &[Option<ValueType>]) -> Result<()> {
        let matched = actual.len() == self.params.len()
            && self
                .params
                .iter()
                .zip(actual)
                .all(|(p, a)| a.is_none_or(|t| p.accepts(t)));

        if matched {
            Ok(())
        } else {
            Err(PolicyError::BadProto {
                function: function.to_string(),
                expected: self.describe(),
                received: describe_types(actual),
            })
        }
    }

    /// 校验已完全解析的参数值
    pub fn check(&self, function: &str, values: &[Value]) -> Result<()> {
        let actual: Vec<Option<ValueType>> = values.iter().map(|v| Some(v.value_type())).collect();
        self.check_partial(function, &actual)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn describe_types(types: &[Option<ValueType>]) -> String {
    if types.is_empty() {
        return "none".to_string();
    }
    types
        .iter()
        .map(|t| match t {
            Some(t) => t.to_string(),
            None => "variable".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
