//! policyd 控制命令
//!
//! 守护进程从标准输入逐行读取命令：
//!
//! ```text
//! set <event> <literal>     设置事件值并增量求值
//! rule <rule line>          添加规则并立即求值
//! var <name(value)>         定义变量
//! delete rule <id>          删除规则
//! delete var <name>         删除变量
//! eval                      全量求值
//! reload                    从存储重新加载
//! list                      列出规则、变量、事件和类型
//! help
//! ```

use anyhow::{Context as _, Result, anyhow, bail};

use crate::context::{BatchReport, PolicyContext};
use crate::evaluator::Evaluation;
use crate::parser::{parse_literal, parse_rule_line};
use crate::value::{Value, ValueType};

pub const HELP: &str = "\
set <event> <literal>     设置事件值
rule <rule line>          添加规则 name | conditions | actions | undos
var <name(value)>         定义变量
delete rule <id>          删除规则
delete var <name>         删除变量
eval                      全量求值
reload                    从存储重新加载
list                      列出规则、变量、事件和类型";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set { event: String, value: Value },
    Rule(String),
    Var(String),
    DeleteRule(String),
    DeleteVar(String),
    Eval,
    Reload,
    List,
    Help,
}

impl Command {
    /// 解析一行命令，空行和注释返回 `None`
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        let command = match verb {
            "set" => {
                let (event, literal) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("用法: set <event> <literal>"))?;
                let value = parse_literal(literal.trim())
                    .with_context(|| format!("无效的事件值: {}", literal.trim()))?;
                Self::Set {
                    event: event.to_string(),
                    value,
                }
            }
            "rule" if !rest.is_empty() => Self::Rule(rest.to_string()),
            "var" if !rest.is_empty() => Self::Var(rest.to_string()),
            "delete" => match rest.split_once(char::is_whitespace) {
                Some(("rule", id)) => Self::DeleteRule(id.trim().to_string()),
                Some(("var", name)) => Self::DeleteVar(name.trim().to_string()),
                _ => bail!("用法: delete rule <id> | delete var <name>"),
            },
            "eval" => Self::Eval,
            "reload" => Self::Reload,
            "list" => Self::List,
            "help" => Self::Help,
            other => bail!("未知命令: {} (输入 help 查看可用命令)", other),
        };
        Ok(Some(command))
    }

    /// 执行命令，返回给操作者的输出
    pub fn execute(self, ctx: &mut PolicyContext) -> Result<String> {
        match self {
            Self::Set { event, value } => {
                let id = ctx.event_id(&event)?;
                let expected = ctx.registry().event(id).map(|e| e.value_type);
                let value = match (expected, value) {
                    (Some(ValueType::Float), Value::Int(i)) => Value::Float(i as f64),
                    (_, value) => value,
                };
                let evaluation = ctx.set_event_value(&event, value)?;
                Ok(describe_evaluation(&evaluation))
            }
            Self::Rule(line) => {
                let text = parse_rule_line(&line)?;
                let report = ctx.add_rule(&text)?;
                let evaluation = ctx.evaluate_rule(&report.rule_id)?;

                let mut lines = vec![format!("规则已添加: {}", report.rule_id)];
                lines.extend(report.skipped.iter().map(|e| format!("  跳过: {}", e)));
                if !evaluation.is_empty() {
                    lines.push(describe_evaluation(&evaluation));
                }
                Ok(lines.join("\n"))
            }
            Self::Var(definition) => {
                let name = ctx.define_variable(&definition)?;
                Ok(format!("变量已定义: {}", name))
            }
            Self::DeleteRule(id) => {
                ctx.delete_rule(&id)?;
                Ok(format!("规则已删除: {}", id))
            }
            Self::DeleteVar(name) => {
                ctx.delete_variable(&name)?;
                Ok(format!("变量已删除: {}", name))
            }
            Self::Eval => Ok(describe_evaluation(&ctx.evaluate_all())),
            Self::Reload => Ok(describe_batch(&ctx.reload()?)),
            Self::List => Ok(describe_context(ctx)),
            Self::Help => Ok(HELP.to_string()),
        }
    }
}

pub fn describe_evaluation(evaluation: &Evaluation) -> String {
    if evaluation.is_empty() {
        return "无规则状态变化".to_string();
    }
    let activated = evaluation.activated.iter().map(|id| format!("激活: {}", id));
    let deactivated = evaluation.deactivated.iter().map(|id| format!("解除: {}", id));
    activated.chain(deactivated).collect::<Vec<_>>().join("\n")
}

pub fn describe_batch(report: &BatchReport) -> String {
    let invalid = report
        .failures
        .iter()
        .filter(|f| f.error.is_validation())
        .count();
    let mut lines = vec![format!(
        "规则 {} 条, 变量 {} 个, 失败 {} 项 (规则无效 {} 项)",
        report.rules_added.len(),
        report.variables_defined.len(),
        report.failures.len(),
        invalid
    )];
    lines.extend(
        report
            .warnings
            .iter()
            .map(|(rule_id, warning)| format!("  {}: {}", rule_id, warning)),
    );
    lines.extend(report.failures.iter().map(|failure| {
        let kind = if failure.error.is_validation() {
            "规则无效"
        } else {
            "无法加载"
        };
        format!(
            "  行 {} ({}) {}: {}",
            failure.line, failure.source, kind, failure.error
        )
    }));
    lines.join("\n")
}

fn describe_context(ctx: &mut PolicyContext) -> String {
    let mut lines = vec!["规则:".to_string()];
    lines.extend(ctx.list_rules().into_iter().map(|summary| {
        let marker = if summary.active { "*" } else { " " };
        format!(" {} {}", marker, summary.text.to_line())
    }));

    lines.push("变量:".to_string());
    lines.extend(
        ctx.list_variables()
            .iter()
            .map(|variable| format!("   {}", variable.definition())),
    );

    lines.push("事件:".to_string());
    lines.extend(
        ctx.list_events()
            .into_iter()
            .map(|(name, value)| format!("   {} = {}", name, value)),
    );

    let (conditions, actions) = ctx.list_types();
    lines.push("条件类型:".to_string());
    lines.extend(conditions.into_iter().map(|(_, pretty)| format!("   {}", pretty)));
    lines.push("动作类型:".to_string());
    lines.extend(actions.into_iter().map(|(_, pretty)| format!("   {}", pretty)));
    lines.join("\n")
}
