//! 策略上下文
//!
//! 进程级的单一上下文，持有注册表、变量缓存、规则集和事件依赖索引。
//! 解析、构建和求值都通过它进行；测试中每个用例构造一个新的上下文。

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{PolicyError, Result};
use crate::model::{
    ActionInstance, ConditionInstance, EventId, PersistedRule, Rule, stored_variable_refs,
};
use crate::parser::{
    FnCall, ParsedRule, RuleText, parse_rule, parse_rule_line, parse_variable_definition,
};
use crate::registry::{Extension, Registry};
use crate::store::{PolicyStore, RULES_PATH, rule_path};
use crate::value::{Argument, Signature, Value, ValueType};
use crate::variables::{Variable, VariableCache};

/// 构建完成但尚未加入规则集的规则
#[derive(Debug)]
pub struct BuiltRule {
    pub rule: Rule,
    /// 被跳过的未注册条件/动作
    pub skipped: Vec<PolicyError>,
}

/// 规则添加结果
#[derive(Debug)]
pub struct BuildReport {
    pub rule_id: String,
    pub skipped: Vec<PolicyError>,
}

/// 批量加载中失败的一行
#[derive(Debug)]
pub struct BatchFailure {
    /// 行号（从 1 开始）；从存储重建时为 0
    pub line: usize,
    pub source: String,
    pub error: PolicyError,
}

/// 批量加载结果
#[derive(Debug, Default)]
pub struct BatchReport {
    pub rules_added: Vec<String>,
    pub variables_defined: Vec<String>,
    /// 规则已添加但有条目被跳过
    pub warnings: Vec<(String, PolicyError)>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.failures.is_empty()
    }
}

/// 规则概要
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSummary {
    pub id: String,
    pub active: bool,
    pub text: RuleText,
}

/// 策略上下文
pub struct PolicyContext {
    pub(crate) registry: Registry,
    pub(crate) variables: VariableCache,
    pub(crate) store: Arc<dyn PolicyStore>,
    /// 按加载顺序排列
    pub(crate) rules: Vec<Rule>,
    /// 事件 -> (规则下标, 条件下标)
    pub(crate) dependents: HashMap<EventId, Vec<(usize, usize)>>,
    /// 存储中无法重建的规则及其变量引用，引用计数保持到规则被替换或删除
    stranded: HashMap<String, Vec<String>>,
}

impl PolicyContext {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            registry: Registry::new(),
            variables: VariableCache::new(store.clone()),
            store,
            rules: Vec::new(),
            dependents: HashMap::new(),
            stranded: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 直接访问注册表，供内嵌扩展注册类型
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn variables_mut(&mut self) -> &mut VariableCache {
        &mut self.variables
    }

    pub fn load_extension(&mut self, extension: &dyn Extension) -> Result<()> {
        self.registry.load(extension)
    }

    // ==================== 规则构建 ====================

    /// 将解析结果与类型注册表对照，构建规则实例
    ///
    /// 未注册的条件/动作被跳过并记入 `skipped`；参数签名不匹配、没有可用条件
    /// 或没有可用动作时整条规则被拒绝。引用计数不在这里增加。
    pub fn build_rule(&mut self, parsed: &ParsedRule) -> Result<BuiltRule> {
        if self.rule(&parsed.name).is_some() {
            return Err(PolicyError::DuplicateRule(parsed.name.clone()));
        }

        let mut skipped = Vec::new();

        let mut conditions = Vec::with_capacity(parsed.conditions.len());
        for call in &parsed.conditions {
            let Some(ctype) = self.registry.condition_type(&call.name) else {
                warn!(rule_id = %parsed.name, condition = %call.name, "未注册的条件类型，已跳过");
                skipped.push(PolicyError::UnknownFunction {
                    kind: "条件",
                    name: call.name.clone(),
                });
                continue;
            };
            self.check_arguments(call, &ctype.signature)?;
            conditions.push(ConditionInstance {
                type_name: call.name.clone(),
                event: ctype.event,
                inverted: call.inverted,
                args: call.args.clone(),
                result: false,
            });
        }

        let actions = self.build_actions(&parsed.name, &parsed.actions, "动作", &mut skipped)?;
        let undos = self.build_actions(&parsed.name, &parsed.undos, "撤销动作", &mut skipped)?;

        if conditions.is_empty() {
            return Err(PolicyError::NoConditions(parsed.name.clone()));
        }
        if actions.is_empty() && undos.is_empty() {
            return Err(PolicyError::NoActions(parsed.name.clone()));
        }

        Ok(BuiltRule {
            rule: Rule {
                id: parsed.name.clone(),
                conditions,
                actions,
                undos,
                active: false,
            },
            skipped,
        })
    }

    fn build_actions(
        &mut self,
        rule_id: &str,
        calls: &[FnCall],
        kind: &'static str,
        skipped: &mut Vec<PolicyError>,
    ) -> Result<Vec<ActionInstance>> {
        let mut actions = Vec::with_capacity(calls.len());
        for call in calls {
            let Some(atype) = self.registry.action_type(&call.name) else {
                warn!(rule_id = %rule_id, action = %call.name, kind, "未注册的动作类型，已跳过");
                skipped.push(PolicyError::UnknownFunction {
                    kind,
                    name: call.name.clone(),
                });
                continue;
            };
            self.check_arguments(call, &atype.signature)?;
            actions.push(ActionInstance {
                type_name: call.name.clone(),
                args: call.args.clone(),
            });
        }
        Ok(actions)
    }

    /// 按签名检查参数；尚未定义的变量跳过类型比较，求值时再检查
    fn check_arguments(&mut self, call: &FnCall, signature: &Signature) -> Result<()> {
        let types: Vec<Option<ValueType>> = call
            .args
            .iter()
            .map(|arg| match arg {
                Argument::Literal(value) => Some(value.value_type()),
                Argument::Variable(name) => self.variables.lookup(name).map(Variable::value_type),
            })
            .collect();
        signature.check_partial(&call.name, &types)
    }

    /// 解析、构建并加入规则集，同时持久化
    ///
    /// 加入后按当前事件值计算各条件，但不执行动作；需要立即激活时调用
    /// [`PolicyContext::evaluate_rule`]。同名的无法重建的存储规则被替换。
    #[instrument(skip(self, text), fields(rule_id = %text.name))]
    pub fn add_rule(&mut self, text: &RuleText) -> Result<BuildReport> {
        let parsed = parse_rule(text)?;
        let built = self.build_rule(&parsed)?;
        self.release_stranded(&built.rule.id);
        self.persist_rule(&built.rule);

        let rule_id = built.rule.id.clone();
        let index = self.insert_rule(built.rule);
        self.refresh_conditions(index);

        info!(skipped = built.skipped.len(), "规则已加载");
        Ok(BuildReport {
            rule_id,
            skipped: built.skipped,
        })
    }

    fn insert_rule(&mut self, rule: Rule) -> usize {
        for name in rule.variable_refs() {
            self.variables.retain(name);
        }
        self.rules.push(rule);
        self.rebuild_dependents();
        self.rules.len() - 1
    }

    fn release_stranded(&mut self, id: &str) -> bool {
        let Some(refs) = self.stranded.remove(id) else {
            return false;
        };
        for name in &refs {
            self.variables.release(name);
        }
        true
    }

    fn persist_rule(&self, rule: &Rule) {
        let path = rule_path(&rule.id);
        let result = rule
            .to_persisted()
            .to_json()
            .and_then(|json| {
                self.store.remove(&path)?;
                self.store.inject(&path, &json)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!(rule_id = %rule.id, error = %e, "规则持久化失败");
        }
    }

    fn rebuild_dependents(&mut self) {
        self.dependents.clear();
        for (r, rule) in self.rules.iter().enumerate() {
            for (c, condition) in rule.conditions.iter().enumerate() {
                self.dependents
                    .entry(condition.event)
                    .or_default()
                    .push((r, c));
            }
        }
    }

    /// 删除规则：释放变量引用并从存储删除，不触发撤销动作
    ///
    /// 也可删除存储中无法重建的规则。
    #[instrument(skip(self))]
    pub fn delete_rule(&mut self, id: &str) -> Result<()> {
        if let Some(position) = self.rules.iter().position(|r| r.id == id) {
            let rule = self.rules.remove(position);
            for name in rule.variable_refs() {
                self.variables.release(name);
            }
            self.rebuild_dependents();
        } else if !self.release_stranded(id) {
            warn!("删除不存在的规则");
            return Err(PolicyError::RuleNotFound(id.to_string()));
        }

        if let Err(e) = self.store.remove(&rule_path(id)) {
            warn!(error = %e, "删除存储中的规则失败");
        }

        info!("规则已删除");
        Ok(())
    }

    // ==================== 变量 ====================

    /// 定义变量 `name(value)`；值为变量引用时复制被引用变量的当前值
    #[instrument(skip(self))]
    pub fn define_variable(&mut self, definition: &str) -> Result<String> {
        let definition = parse_variable_definition(definition)?;
        let value = match definition.value {
            Argument::Literal(value) => value,
            Argument::Variable(source) => self
                .variables
                .resolve(&source)
                .ok_or(PolicyError::UnresolvedVariable(source))?,
        };

        self.variables.add_or_overwrite(&definition.name, value)?;
        Ok(definition.name)
    }

    #[instrument(skip(self))]
    pub fn delete_variable(&mut self, name: &str) -> Result<()> {
        self.variables.delete(name)
    }

    // ==================== 批量加载 ====================

    /// 加载策略文本
    ///
    /// 每行一条规则 `name | conditions | actions | undos` 或一个变量定义
    /// `var name(value)`；空行和 `#` 开头的行被忽略。出错的行记入报告，其余行继续处理。
    #[instrument(skip(self, text))]
    pub fn load_policy_text(&mut self, text: &str) -> BatchReport {
        let mut report = BatchReport::default();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let result = match variable_line(line) {
                Some(definition) => self
                    .define_variable(definition)
                    .map(|name| report.variables_defined.push(name)),
                None => parse_rule_line(line)
                    .and_then(|text| self.add_rule(&text))
                    .map(|built| {
                        for warning in built.skipped {
                            report.warnings.push((built.rule_id.clone(), warning));
                        }
                        report.rules_added.push(built.rule_id);
                    }),
            };

            if let Err(error) = result {
                warn!(line = index + 1, error = %error, "策略行加载失败");
                report.failures.push(BatchFailure {
                    line: index + 1,
                    source: line.to_string(),
                    error,
                });
            }
        }

        info!(
            rules = report.rules_added.len(),
            variables = report.variables_defined.len(),
            failures = report.failures.len(),
            "策略文本加载完成"
        );
        report
    }

    /// 重新加载策略
    ///
    /// 丢弃所有规则并使变量缓存失效，从存储的规则命名空间重建规则（不回写），
    /// 最后执行全量求值。
    #[instrument(skip(self))]
    pub fn reload(&mut self) -> Result<BatchReport> {
        for rule in std::mem::take(&mut self.rules) {
            for name in rule.variable_refs() {
                self.variables.release(name);
            }
        }
        for name in std::mem::take(&mut self.stranded).into_values().flatten() {
            self.variables.release(&name);
        }
        self.dependents.clear();
        self.variables.invalidate();

        let mut report = BatchReport::default();
        let stored = match self.store.dump(RULES_PATH) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => serde_json::Map::new(),
            Err(e) => {
                warn!(error = %e, "读取存储中的规则失败");
                serde_json::Map::new()
            }
        };

        for (id, json) in stored {
            let refs = stored_variable_refs(&json);
            let result = PersistedRule::from_json(json)
                .and_then(|persisted| persisted.to_text(&id))
                .and_then(|text| parse_rule(&text))
                .and_then(|parsed| self.build_rule(&parsed));

            match result {
                Ok(built) => {
                    for warning in built.skipped {
                        report.warnings.push((id.clone(), warning));
                    }
                    self.insert_rule(built.rule);
                    report.rules_added.push(id);
                }
                Err(error) => {
                    warn!(rule_id = %id, error = %error, "存储中的规则无法重建");
                    // 规则仍在存储中，其引用的变量不能被删除
                    for name in &refs {
                        self.variables.retain(name);
                    }
                    self.stranded.insert(id.clone(), refs);
                    report.failures.push(BatchFailure {
                        line: 0,
                        source: id,
                        error,
                    });
                }
            }
        }

        let evaluation = self.evaluate_all();
        info!(
            rules = self.rules.len(),
            failures = report.failures.len(),
            activated = evaluation.activated.len(),
            "策略已重新加载"
        );
        Ok(report)
    }

    /// 存储中是否已有规则
    pub fn store_has_rules(&self) -> bool {
        match self.store.dump(RULES_PATH) {
            Ok(serde_json::Value::Object(map)) => !map.is_empty(),
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "读取存储中的规则失败");
                false
            }
        }
    }

    // ==================== 事件 ====================

    /// 按名称查找事件编号
    pub fn event_id(&self, name: &str) -> Result<EventId> {
        self.registry
            .event_id(name)
            .ok_or_else(|| PolicyError::UnknownEvent(name.to_string()))
    }

    // ==================== 查询 ====================

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn list_rules(&self) -> Vec<RuleSummary> {
        self.rules
            .iter()
            .map(|rule| RuleSummary {
                id: rule.id.clone(),
                active: rule.active,
                text: rule.to_text(),
            })
            .collect()
    }

    pub fn list_variables(&mut self) -> Vec<Variable> {
        self.variables.list()
    }

    /// 事件名称和当前值
    pub fn list_events(&self) -> Vec<(String, Value)> {
        self.registry
            .events()
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }

    /// 条件和动作类型的名称与可读签名
    pub fn list_types(&self) -> (Vec<(String, String)>, Vec<(String, String)>) {
        let conditions = self
            .registry
            .condition_types()
            .iter()
            .map(|t| (t.name.clone(), t.pretty_signature.clone()))
            .collect();
        let actions = self
            .registry
            .action_types()
            .iter()
            .map(|t| (t.name.clone(), t.pretty_signature.clone()))
            .collect();
        debug!("列出已注册类型");
        (conditions, actions)
    }
}

/// 变量定义行 `var name(value)`：首个空白分隔的词为 `var` 且后面不是规则分隔符
fn variable_line(line: &str) -> Option<&str> {
    let (keyword, rest) = line.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();
    (keyword == "var" && !rest.starts_with('|')).then_some(rest)
}
