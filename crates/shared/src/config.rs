//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
        }
    }
}

impl ObservabilityConfig {
    /// 是否输出 JSON 格式日志
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 目标下没有任何启用规则时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyRulePolicy {
    /// 保持现有成员不变
    #[default]
    LeaveUntouched,
    /// 清空现有成员
    ClearMembership,
}

/// 成员同步配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// 全量扫描的最大行数，None 表示不限制
    pub max_rows: Option<u64>,
    /// 全量扫描的最长耗时（毫秒），None 表示不限制
    pub max_duration_ms: Option<u64>,
    /// 新增成员的默认排序位置
    pub default_position: i32,
    /// 库存关联使用的固定库存 ID
    pub stock_id: i64,
    pub empty_rule_policy: EmptyRulePolicy,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            max_rows: None,
            max_duration_ms: None,
            default_position: 0,
            stock_id: 1,
            empty_rule_policy: EmptyRulePolicy::LeaveUntouched,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（CATALOG_ 前缀，如 CATALOG_RECONCILIATION__MAX_ROWS -> reconciliation.max_rows）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("CATALOG_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(service_name, &env, Path::new(&config_dir))
    }

    /// 从指定目录加载配置
    pub fn load_from(service_name: &str, env: &str, config_dir: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            // 双下划线分隔嵌套层级，避免与字段名中的单下划线冲突
            .add_source(
                Environment::with_prefix("CATALOG")
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
