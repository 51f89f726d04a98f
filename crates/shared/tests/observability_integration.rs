//! 共享库集成测试
//!
//! 测试配置文件分层加载和指标记录函数。

use catalog_shared::config::{AppConfig, EmptyRulePolicy};
use catalog_shared::observability::metrics::{record_reconciliation, record_rule_evaluation};
use catalog_shared::observability::ObservabilityGuard;
use std::fs;
use std::path::PathBuf;

/// 每个测试使用独立的临时配置目录
fn config_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("catalog-config-{}-{}", name, std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_config_files_are_layered() {
    let dir = config_dir("layered");
    fs::write(
        dir.join("default.toml"),
        r#"
[observability]
log_level = "debug"

[reconciliation]
max_rows = 1000
default_position = 5
"#,
    )
    .unwrap();
    fs::write(
        dir.join("staging.toml"),
        r#"
[reconciliation]
max_rows = 2000
empty_rule_policy = "clear_membership"
"#,
    )
    .unwrap();
    fs::write(
        dir.join("catalog-rules.toml"),
        r#"
[observability]
log_format = "json"
"#,
    )
    .unwrap();

    let config = AppConfig::load_from("catalog-rules", "staging", &dir).unwrap();

    assert_eq!(config.service_name, "catalog-rules");
    assert_eq!(config.observability.log_level, "debug");
    assert!(config.observability.json_logs());
    assert_eq!(config.reconciliation.max_rows, Some(2000));
    assert_eq!(config.reconciliation.default_position, 5);
    assert_eq!(config.reconciliation.stock_id, 1);
    assert_eq!(
        config.reconciliation.empty_rule_policy,
        EmptyRulePolicy::ClearMembership
    );

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_other_environment_file_is_ignored() {
    let dir = config_dir("env");
    fs::write(
        dir.join("production.toml"),
        "[reconciliation]\nmax_duration_ms = 100\n",
    )
    .unwrap();

    let config = AppConfig::load_from("catalog-rules", "development", &dir).unwrap();
    assert_eq!(config.reconciliation.max_duration_ms, None);
    assert!(!config.is_production());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_invalid_policy_is_rejected() {
    let dir = config_dir("invalid");
    fs::write(
        dir.join("default.toml"),
        "[reconciliation]\nempty_rule_policy = \"delete_everything\"\n",
    )
    .unwrap();

    assert!(AppConfig::load_from("catalog-rules", "test", &dir).is_err());

    fs::remove_dir_all(&dir).unwrap();
}

/// 未安装记录器时，指标记录是空操作
#[test]
fn test_metrics_without_recorder() {
    record_rule_evaluation("per_object", 12, 0.004);
    record_rule_evaluation("compiled", 0, 0.0);
    record_reconciliation("synced", 3, 1);
    record_reconciliation("unchanged", 0, 0);
    record_reconciliation("failed", 0, 0);

    assert!(ObservabilityGuard::empty().render_metrics().is_none());
}
