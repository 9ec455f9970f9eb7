//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// 环境变量前缀（POLICYD_POLICY__STORE_PATH -> policy.store_path）
const ENV_PREFIX: &str = "POLICYD";

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// 服务名称，写入每条日志的 target 之外的标识
    pub service_name: String,
    /// 日志级别（如 "info", "debug"，或完整的 EnvFilter 指令）
    pub log_level: String,
    /// 是否启用 JSON 格式日志
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "policyd".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// 注入服务名
    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }
}

/// 事件声明
///
/// 由内置阈值扩展读取，为每个事件注册一组比较条件类型。
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EventDeclaration {
    pub name: String,
    #[serde(default)]
    pub stateless: bool,
    /// 值类型：int / float / string / bool
    pub value_type: String,
    /// 复位值，按参数字面量语法书写（如 `100`、`f`、`"none"`）
    pub reset_value: String,
}

/// 策略配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// 持久化存储文件路径
    pub store_path: PathBuf,
    /// 存储为空时用于初始化的策略文本文件
    pub rules_file: Option<PathBuf>,
    /// 事件声明列表
    pub events: Vec<EventDeclaration>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/policy-store.json"),
            rules_file: None,
            events: Vec::new(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub observability: ObservabilityConfig,
    pub policy: PolicyConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（POLICYD_ 前缀，`__` 分隔层级）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("POLICYD_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(Path::new(&config_dir), service_name, &env)
    }

    /// 从指定目录加载配置
    pub fn load_from(config_dir: &Path, service_name: &str, env: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
