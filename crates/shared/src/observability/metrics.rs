//! Prometheus 指标模块
//!
//! 基于 metrics crate 记录规则评估与成员同步指标。
//! 引擎以库的形式嵌入调用方，不启动独立的 HTTP 端点；调用方可通过句柄渲染指标快照。

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Metrics 资源守卫
pub struct MetricsHandle {
    handle: PrometheusHandle,
}

impl MetricsHandle {
    /// 渲染 Prometheus 文本格式的指标快照
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// 安装全局 Prometheus 记录器
pub fn init(service_name: &str) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(service_name);

    Ok(MetricsHandle { handle })
}

/// 注册通用指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("rule_evaluations_total", "Total number of rule evaluations");
    metrics::describe_histogram!(
        "rule_evaluation_duration_seconds",
        "Rule evaluation duration in seconds"
    );

    metrics::describe_counter!(
        "rule_reconciliations_total",
        "Total number of target membership reconciliations"
    );
    metrics::describe_counter!(
        "rule_membership_changes_total",
        "Total number of membership rows added or removed"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次规则评估
#[inline]
pub fn record_rule_evaluation(strategy: &str, matched: usize, duration_secs: f64) {
    metrics::counter!(
        "rule_evaluations_total",
        "strategy" => strategy.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "rule_evaluation_duration_seconds",
        "strategy" => strategy.to_string()
    )
    .record(duration_secs);

    metrics::histogram!("rule_evaluation_matched_rows").record(matched as f64);
}

/// 记录一次目标同步
#[inline]
pub fn record_reconciliation(status: &str, added: usize, removed: usize) {
    metrics::counter!(
        "rule_reconciliations_total",
        "status" => status.to_string()
    )
    .increment(1);

    if added > 0 {
        metrics::counter!("rule_membership_changes_total", "direction" => "added")
            .increment(added as u64);
    }
    if removed > 0 {
        metrics::counter!("rule_membership_changes_total", "direction" => "removed")
            .increment(removed as u64);
    }
}
