//! 持久化存储
//!
//! 策略引擎通过 [`PolicyStore`] 读写变量和规则。存储以 `/` 分隔的层级路径寻址，
//! 叶子节点保存 JSON 标量；`inject` / `dump` 以 JSON 对象批量写入和读取子树。
//!
//! - [`MemoryStore`]：基于 DashMap 的内存实现，适用于测试和嵌入式场景
//! - [`FileStore`]：在内存实现之上，每次变更后将整棵树写回 JSON 文件

use crate::error::{StoreError, StoreResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value as JsonValue};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// 变量命名空间
pub const VARIABLES_PATH: &str = "/policy/variables";
/// 规则命名空间
pub const RULES_PATH: &str = "/policy/rules";

pub fn variable_path(name: &str) -> String {
    child_path(VARIABLES_PATH, name)
}

pub fn rule_path(id: &str) -> String {
    child_path(RULES_PATH, id)
}

/// 持久化存储接口
#[cfg_attr(test, mockall::automock)]
pub trait PolicyStore: Send + Sync {
    /// 读取叶子节点，不存在时返回 `None`
    fn read(&self, path: &str) -> StoreResult<Option<String>>;

    /// 写入叶子节点
    fn write(&self, path: &str, value: &str) -> StoreResult<()>;

    /// 以 JSON 对象批量写入子树
    fn inject(&self, path: &str, blob: &JsonValue) -> StoreResult<()>;

    /// 以 JSON 对象读取子树，不存在时返回空对象
    fn dump(&self, path: &str) -> StoreResult<JsonValue>;

    /// 删除节点及其所有子节点
    fn remove(&self, path: &str) -> StoreResult<()>;
}

fn normalize(path: &str) -> &str {
    path.trim_end_matches('/')
}

fn child_path(parent: &str, key: &str) -> String {
    format!("{}/{}", normalize(parent), key)
}

/// 内存存储
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<DashMap<String, JsonValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 叶子节点数量
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn inject_value(&self, path: &str, blob: &JsonValue) {
        match blob {
            JsonValue::Object(map) => {
                for (key, value) in map {
                    self.inject_value(&child_path(path, key), value);
                }
            }
            JsonValue::Null => {}
            scalar => {
                self.data.insert(normalize(path).to_string(), scalar.clone());
            }
        }
    }
}

impl PolicyStore for MemoryStore {
    fn read(&self, path: &str) -> StoreResult<Option<String>> {
        Ok(self.data.get(normalize(path)).map(|v| match v.value() {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        }))
    }

    fn write(&self, path: &str, value: &str) -> StoreResult<()> {
        let path = normalize(path);
        if path.is_empty() {
            return Err(StoreError::Unavailable("不能写入根节点".to_string()));
        }
        self.data
            .insert(path.to_string(), JsonValue::String(value.to_string()));
        Ok(())
    }

    fn inject(&self, path: &str, blob: &JsonValue) -> StoreResult<()> {
        self.inject_value(path, blob);
        Ok(())
    }

    fn dump(&self, path: &str) -> StoreResult<JsonValue> {
        let path = normalize(path);
        if let Some(leaf) = self.data.get(path) {
            return Ok(leaf.value().clone());
        }

        let prefix = format!("{}/", path);
        let mut root = Map::new();
        for entry in self.data.iter() {
            let Some(rest) = entry.key().strip_prefix(&prefix) else {
                continue;
            };
            insert_nested(&mut root, rest, entry.value().clone());
        }
        Ok(JsonValue::Object(root))
    }

    fn remove(&self, path: &str) -> StoreResult<()> {
        let path = normalize(path);
        let prefix = format!("{}/", path);
        self.data
            .retain(|key, _| key != path && !key.starts_with(&prefix));
        Ok(())
    }
}

/// 按相对路径把叶子值放入嵌套对象
fn insert_nested(root: &mut Map<String, JsonValue>, relative: &str, value: JsonValue) {
    let mut segments = relative.split('/').peekable();
    let mut current = root;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if !slot.is_object() {
            *slot = JsonValue::Object(Map::new());
        }
        let JsonValue::Object(map) = slot else {
            return;
        };
        current = map;
    }
}

/// 文件存储
///
/// 打开时加载 JSON 文件到内存，每次变更后整体写回。
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    flush_lock: Mutex<()>,
}

impl FileStore {
    /// 打开存储文件，文件不存在时从空树开始
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = MemoryStore::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if !content.trim().is_empty() {
                let tree: JsonValue = serde_json::from_str(&content)?;
                inner.inject_value("", &tree);
            }
            info!(path = %path.display(), entries = inner.len(), "已加载策略存储文件");
        } else {
            info!(path = %path.display(), "策略存储文件不存在，使用空存储");
        }

        Ok(Self {
            path,
            inner,
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> StoreResult<()> {
        let _guard = self.flush_lock.lock();
        let tree = self.inner.dump("")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&tree)?)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), "策略存储已写回");
        Ok(())
    }
}

impl PolicyStore for FileStore {
    fn read(&self, path: &str) -> StoreResult<Option<String>> {
        self.inner.read(path)
    }

    fn write(&self, path: &str, value: &str) -> StoreResult<()> {
        self.inner.write(path, value)?;
        self.flush()
    }

    fn inject(&self, path: &str, blob: &JsonValue) -> StoreResult<()> {
        self.inner.inject(path, blob)?;
        self.flush()
    }

    fn dump(&self, path: &str) -> StoreResult<JsonValue> {
        self.inner.dump(path)
    }

    fn remove(&self, path: &str) -> StoreResult<()> {
        self.inner.remove(path)?;
        self.flush()
    }
}
