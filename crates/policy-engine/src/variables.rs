//! 变量缓存
//!
//! 持久化存储之上的写穿缓存。变量按名称被规则参数引用，
//! 引用计数大于 0 的变量不能删除。

use crate::error::{PolicyError, Result};
use crate::parser::{is_identifier, parse_literal};
use crate::store::{PolicyStore, VARIABLES_PATH, variable_path};
use crate::value::{Value, ValueType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 缓存中的变量
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub value: Value,
}

impl Variable {
    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }

    /// 变量定义文本 `name(value)`
    pub fn definition(&self) -> String {
        format!("{}({})", self.name, self.value.to_literal())
    }
}

/// 变量缓存
pub struct VariableCache {
    store: Arc<dyn PolicyStore>,
    entries: HashMap<String, Variable>,
    /// 规则参数对变量的引用计数，独立于缓存条目
    refs: HashMap<String, usize>,
}

impl VariableCache {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            entries: HashMap::new(),
            refs: HashMap::new(),
        }
    }

    /// 查找变量，缓存未命中时从存储加载
    ///
    /// 存储读取失败或值无法解析时视为不存在。
    pub fn lookup(&mut self, name: &str) -> Option<&Variable> {
        if !self.entries.contains_key(name) {
            let value = self.load_from_store(name)?;
            debug!(variable = %name, value = %value, "变量已从存储加载");
            self.entries.insert(
                name.to_string(),
                Variable {
                    name: name.to_string(),
                    value,
                },
            );
        }
        self.entries.get(name)
    }

    fn load_from_store(&self, name: &str) -> Option<Value> {
        let text = match self.store.read(&variable_path(name)) {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!(variable = %name, error = %e, "读取变量失败");
                return None;
            }
        };

        match parse_literal(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(variable = %name, stored = %text, error = %e, "存储中的变量值无效");
                None
            }
        }
    }

    /// 当前值，供条件/动作参数使用
    pub fn resolve(&mut self, name: &str) -> Option<Value> {
        self.lookup(name).map(|v| v.value.clone())
    }

    /// 新建变量或覆盖同类型变量的值，并写穿到存储
    ///
    /// 类型不一致时返回错误，缓存和存储保持不变。
    pub fn add_or_overwrite(&mut self, name: &str, value: Value) -> Result<()> {
        if !is_identifier(name) {
            return Err(PolicyError::InvalidName(name.to_string()));
        }
        value.check_literal()?;

        if let Some(existing) = self.lookup(name) {
            if existing.value_type() != value.value_type() {
                return Err(PolicyError::VariableTypeMismatch {
                    name: name.to_string(),
                    existing: existing.value_type().to_string(),
                    requested: value.value_type().to_string(),
                });
            }
        }

        if let Err(e) = self.store.write(&variable_path(name), &value.to_literal()) {
            warn!(variable = %name, error = %e, "写入变量失败");
        }

        info!(variable = %name, value = %value, "变量已定义");
        self.entries.insert(
            name.to_string(),
            Variable {
                name: name.to_string(),
                value,
            },
        );
        Ok(())
    }

    /// 删除变量；仍被引用时失败
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let refs = self.refs(name);
        if refs > 0 {
            return Err(PolicyError::VariableInUse {
                name: name.to_string(),
                refs,
            });
        }
        if self.lookup(name).is_none() {
            return Err(PolicyError::VariableNotFound(name.to_string()));
        }

        self.entries.remove(name);
        if let Err(e) = self.store.remove(&variable_path(name)) {
            warn!(variable = %name, error = %e, "删除存储中的变量失败");
        }

        info!(variable = %name, "变量已删除");
        Ok(())
    }

    /// 增加引用计数
    pub fn retain(&mut self, name: &str) {
        *self.refs.entry(name.to_string()).or_insert(0) += 1;
    }

    /// 减少引用计数
    pub fn release(&mut self, name: &str) {
        if let Some(count) = self.refs.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.refs.remove(name);
            }
        }
    }

    pub fn refs(&self, name: &str) -> usize {
        self.refs.get(name).copied().unwrap_or(0)
    }

    /// 丢弃所有缓存条目，之后的查找重新从存储加载
    pub fn invalidate(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        debug!(count, "变量缓存已失效");
    }

    /// 列出存储和缓存中的所有变量，按名称排序
    pub fn list(&mut self) -> Vec<Variable> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();

        match self.store.dump(VARIABLES_PATH) {
            Ok(serde_json::Value::Object(map)) => names.extend(map.keys().cloned()),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "读取变量列表失败"),
        }

        names.sort();
        names.dedup();
        names
            .iter()
            .filter_map(|name| self.lookup(name).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{MemoryStore, MockPolicyStore};

    fn cache() -> (VariableCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (VariableCache::new(store.clone()), store)
    }

    #[test]
    fn test_add_then_lookup() {
        let (mut cache, store) = cache();
        cache.add_or_overwrite("v", Value::Int(5)).unwrap();

        assert_eq!(cache.lookup("v").unwrap().value, Value::Int(5));
        assert_eq!(
            store.read(&variable_path("v")).unwrap(),
            Some("5".to_string())
        );
    }

    #[test]
    fn test_type_mismatch_leaves_value() {
        let (mut cache, store) = cache();
        cache.add_or_overwrite("v", Value::Int(5)).unwrap();

        let err = cache.add_or_overwrite("v", Value::from("x")).unwrap_err();
        assert!(matches!(err, PolicyError::VariableTypeMismatch { .. }));
        assert_eq!(cache.resolve("v"), Some(Value::Int(5)));
        assert_eq!(
            store.read(&variable_path("v")).unwrap(),
            Some("5".to_string())
        );
    }

    #[test]
    fn test_overwrite_same_type() {
        let (mut cache, _) = cache();
        cache.add_or_overwrite("v", Value::Int(5)).unwrap();
        cache.add_or_overwrite("v", Value::Int(7)).unwrap();
        assert_eq!(cache.resolve("v"), Some(Value::Int(7)));
    }

    #[test]
    fn test_unrepresentable_value_rejected() {
        let (mut cache, store) = cache();
        cache.add_or_overwrite("msg", Value::from("quiet")).unwrap();

        let err = cache
            .add_or_overwrite("msg", Value::from("say \"hi\""))
            .unwrap_err();
        assert!(matches!(err, PolicyError::UnrepresentableValue(_)));
        assert!(cache.add_or_overwrite("ratio", Value::Float(f64::NAN)).is_err());

        // 存储中的值仍可解析回来
        cache.invalidate();
        assert_eq!(cache.resolve("msg"), Some(Value::from("quiet")));
        assert_eq!(store.read(&variable_path("ratio")).unwrap(), None);
    }

    #[test]
    fn test_lookup_loads_from_store() {
        let (mut cache, store) = cache();
        store.write(&variable_path("label"), "\"dim\"").unwrap();

        assert_eq!(cache.resolve("label"), Some(Value::from("dim")));
        assert!(cache.lookup("missing").is_none());
    }

    #[test]
    fn test_type_fixed_by_stored_value() {
        let (mut cache, store) = cache();
        store.write(&variable_path("v"), "1.5").unwrap();

        assert!(cache.add_or_overwrite("v", Value::Int(1)).is_err());
    }

    #[test]
    fn test_delete_respects_refs() {
        let (mut cache, store) = cache();
        cache.add_or_overwrite("v", Value::Int(5)).unwrap();
        cache.retain("v");
        cache.retain("v");

        assert!(matches!(
            cache.delete("v").unwrap_err(),
            PolicyError::VariableInUse { refs: 2, .. }
        ));

        cache.release("v");
        cache.release("v");
        cache.delete("v").unwrap();
        assert_eq!(store.read(&variable_path("v")).unwrap(), None);
        assert!(matches!(
            cache.delete("v").unwrap_err(),
            PolicyError::VariableNotFound(_)
        ));
    }

    #[test]
    fn test_release_never_underflows() {
        let (mut cache, _) = cache();
        cache.release("v");
        assert_eq!(cache.refs("v"), 0);
    }

    #[test]
    fn test_invalidate_reloads_from_store() {
        let (mut cache, store) = cache();
        cache.add_or_overwrite("v", Value::Int(5)).unwrap();
        store.write(&variable_path("v"), "9").unwrap();

        assert_eq!(cache.resolve("v"), Some(Value::Int(5)));
        cache.invalidate();
        assert_eq!(cache.resolve("v"), Some(Value::Int(9)));
    }

    #[test]
    fn test_list_merges_store_and_cache() {
        let (mut cache, store) = cache();
        store.write(&variable_path("b"), "t").unwrap();
        cache.add_or_overwrite("a", Value::Int(1)).unwrap();

        let names: Vec<_> = cache.list().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_store_read_failure_is_absent() {
        let mut store = MockPolicyStore::new();
        store
            .expect_read()
            .returning(|_| Err(StoreError::Unavailable("offline".to_string())));

        let mut cache = VariableCache::new(Arc::new(store));
        assert!(cache.lookup("v").is_none());
    }

    #[test]
    fn test_store_write_failure_is_best_effort() {
        let mut store = MockPolicyStore::new();
        store.expect_read().returning(|_| Ok(None));
        store
            .expect_write()
            .times(1)
            .returning(|_, _| Err(StoreError::Unavailable("offline".to_string())));

        let mut cache = VariableCache::new(Arc::new(store));
        cache.add_or_overwrite("v", Value::Bool(true)).unwrap();
        assert_eq!(cache.resolve("v"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let (mut cache, _) = cache();
        assert!(matches!(
            cache.add_or_overwrite("1v", Value::Int(1)).unwrap_err(),
            PolicyError::InvalidName(_)
        ));
    }
}
