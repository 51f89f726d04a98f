//! 统一可观测性模块
//!
//! 提供 logging 与 metrics 的统一初始化。
//! 引擎的调用方（调度任务、命令行工具）通过单一入口点配置可观测性，确保一致的指标命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;

use crate::config::ObservabilityConfig;

/// 可观测性资源守卫
///
/// 持有 metrics 记录器句柄，drop 时输出关闭日志。
pub struct ObservabilityGuard {
    metrics_handle: Option<metrics::MetricsHandle>,
}

impl ObservabilityGuard {
    /// 创建一个空的 Guard（用于测试或禁用可观测性时）
    pub fn empty() -> Self {
        Self {
            metrics_handle: None,
        }
    }

    /// 渲染当前的 Prometheus 指标快照，未启用 metrics 时返回 None
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics_handle.as_ref().map(|h| h.render())
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        info!("Shutting down observability...");
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics（Prometheus 记录器，仅在配置启用时安装）
///
/// # Example
///
/// ```ignore
/// use catalog_shared::config::AppConfig;
/// use catalog_shared::observability;
///
/// fn main() -> anyhow::Result<()> {
///     let config = AppConfig::load("catalog-rules")?;
///     let _guard = observability::init(&config.service_name, &config.observability)?;
///     Ok(())
/// }
/// ```
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    info!(
        service = %service_name,
        log_format = %config.log_format,
        metrics_enabled = config.metrics_enabled,
        "Observability initialized"
    );

    let metrics_handle = if config.metrics_enabled {
        Some(metrics::init(service_name)?)
    } else {
        None
    };

    Ok(ObservabilityGuard { metrics_handle })
}
