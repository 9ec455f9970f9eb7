//! 策略文本解析器
//!
//! 将变量定义、规则的条件/动作/撤销动作列表以及单个参数字面量解析成
//! 中间表示（函数名 + 有序的类型化参数）。解析完全同步，对一个输入字符串
//! 一次性运行到结束或第一个错误。
//!
//! # 语法
//!
//! ```text
//! FNLIST  ::= FNITEM (" " FNITEM)*
//! FNITEM  ::= "!"? IDENT "(" ARGLIST? ")"
//! ARGLIST ::= ARG ((" " | ",") ARG)*
//! ARG     ::= "\"" STRING "\"" | "-"? DIGITS ("." DIGITS)? | BOOL | "$" IDENT
//! ```

mod fsm;

use crate::error::{PolicyError, Result};
use crate::value::{Argument, Value};
use fsm::Machine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 解析模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseMode {
    VariableDefinition,
    Conditions,
    Actions,
    UndoActions,
    Argument,
    RuleLine,
}

impl fmt::Display for ParseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::VariableDefinition => "变量定义",
            Self::Conditions => "条件列表",
            Self::Actions => "动作列表",
            Self::UndoActions => "撤销动作列表",
            Self::Argument => "参数",
            Self::RuleLine => "规则行",
        };
        f.write_str(s)
    }
}

/// 函数调用的中间表示
#[derive(Debug, Clone, PartialEq)]
pub struct FnCall {
    pub name: String,
    /// 仅条件可以取反
    pub inverted: bool,
    pub args: Vec<Argument>,
}

impl FnCall {
    pub fn new(name: impl Into<String>, args: Vec<Argument>) -> Self {
        Self {
            name: name.into(),
            inverted: false,
            args,
        }
    }

    pub fn inverted(mut self) -> Self {
        self.inverted = true;
        self
    }
}

impl fmt::Display for FnCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inverted {
            f.write_str("!")?;
        }
        let args = self
            .args
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}({})", self.name, args)
    }
}

/// 变量定义 `name(value)`
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub value: Argument,
}

/// 规则的四段文本形式
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleText {
    pub name: String,
    pub conditions: String,
    #[serde(default)]
    pub actions: String,
    #[serde(default)]
    pub undos: String,
}

impl RuleText {
    pub fn new(
        name: impl Into<String>,
        conditions: impl Into<String>,
        actions: impl Into<String>,
        undos: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            conditions: conditions.into(),
            actions: actions.into(),
            undos: undos.into(),
        }
    }

    /// 渲染为单行形式 `name | conditions | actions | undos`
    pub fn to_line(&self) -> String {
        format!(
            "{} | {} | {} | {}",
            self.name, self.conditions, self.actions, self.undos
        )
    }
}

/// 解析后的规则
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRule {
    pub name: String,
    pub conditions: Vec<FnCall>,
    pub actions: Vec<FnCall>,
    pub undos: Vec<FnCall>,
}

/// 解析函数调用列表
pub fn parse_function_list(mode: ParseMode, input: &str) -> Result<Vec<FnCall>> {
    debug_assert!(matches!(
        mode,
        ParseMode::Conditions | ParseMode::Actions | ParseMode::UndoActions
    ));
    Ok(Machine::new(mode).run(input)?.calls)
}

pub fn parse_conditions(input: &str) -> Result<Vec<FnCall>> {
    parse_function_list(ParseMode::Conditions, input)
}

pub fn parse_actions(input: &str) -> Result<Vec<FnCall>> {
    parse_function_list(ParseMode::Actions, input)
}

pub fn parse_undo_actions(input: &str) -> Result<Vec<FnCall>> {
    parse_function_list(ParseMode::UndoActions, input)
}

/// 解析变量定义 `name(value)`
pub fn parse_variable_definition(input: &str) -> Result<VariableDefinition> {
    let mut output = Machine::new(ParseMode::VariableDefinition).run(input)?;
    let mut call = output
        .calls
        .pop()
        .ok_or_else(|| PolicyError::MissingValue(input.trim().to_string()))?;
    let value = call
        .args
        .pop()
        .ok_or_else(|| PolicyError::MissingValue(call.name.clone()))?;

    Ok(VariableDefinition {
        name: call.name,
        value,
    })
}

/// 解析单个参数字面量（可以是变量引用）
pub fn parse_argument(input: &str) -> Result<Argument> {
    Machine::new(ParseMode::Argument)
        .run(input)?
        .args
        .pop()
        .ok_or(PolicyError::Parse {
            mode: ParseMode::Argument,
            position: 0,
            found: fsm::describe_char('\0'),
            expected: "参数字面量",
        })
}

/// 解析单个字面量值，变量引用视为错误
pub fn parse_literal(input: &str) -> Result<Value> {
    match parse_argument(input)? {
        Argument::Literal(value) => Ok(value),
        Argument::Variable(name) => Err(PolicyError::UnresolvedVariable(name)),
    }
}

/// 标识符：字母或下划线开头，后接字母、数字或下划线
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// 校验规则名称
pub fn validate_rule_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PolicyError::EmptyName);
    }
    if !is_identifier(name) {
        return Err(PolicyError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// 解析规则的四段文本
pub fn parse_rule(text: &RuleText) -> Result<ParsedRule> {
    let name = text.name.trim();
    validate_rule_name(name)?;

    Ok(ParsedRule {
        name: name.to_string(),
        conditions: parse_conditions(&text.conditions)?,
        actions: parse_actions(&text.actions)?,
        undos: parse_undo_actions(&text.undos)?,
    })
}

/// 拆分单行规则 `name | conditions | actions | undos`
///
/// 字符串字面量内的 `|` 不作为分隔符；动作和撤销动作可以省略。
pub fn parse_rule_line(line: &str) -> Result<RuleText> {
    let mut fields = Vec::with_capacity(4);
    let mut current = String::new();
    let mut in_string = false;

    for (position, c) in line.chars().enumerate() {
        match c {
            '"' => {
                in_string = !in_string;
                current.push(c);
            }
            '|' if !in_string => {
                if fields.len() == 3 {
                    return Err(PolicyError::Parse {
                        mode: ParseMode::RuleLine,
                        position,
                        found: "'|'".to_string(),
                        expected: "最多 4 个字段",
                    });
                }
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    fields.push(current);

    let mut fields = fields.into_iter().map(|f| f.trim().to_string());
    Ok(RuleText {
        name: fields.next().unwrap_or_default(),
        conditions: fields.next().unwrap_or_default(),
        actions: fields.next().unwrap_or_default(),
        undos: fields.next().unwrap_or_default(),
    })
}

/// 将函数调用列表渲染回文本形式
pub fn render_calls(calls: &[FnCall]) -> String {
    calls
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
