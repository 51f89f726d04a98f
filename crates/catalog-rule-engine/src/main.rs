//! 商品规则命令行工具
//!
//! 读取一份目录快照（属性元数据、商品、分类关联、库存、规则和当前成员），
//! 预览规则匹配数量、同步目标成员或解释单个商品的评估过程，结果以 JSON 输出。
//!
//! ```text
//! catalog-rules <snapshot.json> [preview | reconcile | explain <rule_id> <product_id>]
//! ```

use anyhow::{Context, Result, bail};
use catalog_shared::config::AppConfig;
use catalog_shared::observability;
use rule_engine::catalog::CatalogSnapshot;
use rule_engine::{
    AttributeMeta, InMemoryAttributeCatalog, MemoryCatalog, MemoryMembershipStore, ProductId,
    ReconcileSettings, ReconciliationEngine, Rule, RuleMatcher, RuleStore, TargetRef,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const SERVICE_NAME: &str = "catalog-rules";

/// 快照文件格式
#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    attributes: Vec<AttributeMeta>,
    #[serde(flatten)]
    catalog: CatalogSnapshot,
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(default)]
    memberships: Vec<Membership>,
}

#[derive(Debug, Deserialize)]
struct Membership {
    target: TargetRef,
    product_ids: Vec<ProductId>,
}

enum Command {
    Preview,
    Reconcile,
    Explain { rule_id: String, product_id: ProductId },
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        match args.first().map(String::as_str) {
            None | Some("preview") => Ok(Self::Preview),
            Some("reconcile") => Ok(Self::Reconcile),
            Some("explain") => {
                let (Some(rule_id), Some(product_id)) = (args.get(1), args.get(2)) else {
                    bail!("explain 需要 <rule_id> <product_id>");
                };
                let product_id = product_id
                    .parse()
                    .with_context(|| format!("无效的商品 ID: {}", product_id))?;
                Ok(Self::Explain {
                    rule_id: rule_id.clone(),
                    product_id,
                })
            }
            Some(other) => bail!("未知命令: {}", other),
        }
    }
}

fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    let guard = observability::init(SERVICE_NAME, &config.observability)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(path) = args.first().map(PathBuf::from) else {
        bail!("用法: catalog-rules <snapshot.json> [preview | reconcile | explain <rule_id> <product_id>]");
    };
    let command = Command::parse(&args[1..])?;

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("读取快照失败: {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&raw)
        .with_context(|| format!("解析快照失败: {}", path.display()))?;

    let metadata = Arc::new(InMemoryAttributeCatalog::from_attributes(snapshot.attributes));
    let catalog = Arc::new(MemoryCatalog::from_snapshot(snapshot.catalog));
    let store = RuleStore::new();
    let loaded = store
        .load_batch(snapshot.rules)
        .context("加载规则失败")?;
    info!(rules = loaded.len(), products = catalog.len(), "快照已加载");

    let settings = ReconcileSettings::from(&config.reconciliation);
    let matcher = RuleMatcher::new(metadata.as_ref(), catalog.as_ref())
        .with_stock_id(settings.stock_id)
        .with_budget(settings.budget);

    let output = match command {
        Command::Preview => {
            let mut previews = Vec::with_capacity(loaded.len());
            for rule_id in &loaded {
                let Some(rule) = store.get(rule_id) else {
                    continue;
                };
                match matcher.preview(&rule) {
                    Ok(preview) => previews.push(preview),
                    Err(e) => warn!(rule_id = %rule_id, error = %e, "规则预览失败"),
                }
            }
            serde_json::to_string_pretty(&previews)?
        }
        Command::Reconcile => {
            let mut membership = MemoryMembershipStore::new();
            for entry in snapshot.memberships {
                membership = membership.with_members(entry.target, entry.product_ids);
            }
            let engine = ReconciliationEngine::new(
                metadata.clone(),
                catalog.clone(),
                Arc::new(store.clone()),
                Arc::new(membership),
            )
            .with_settings(settings);
            serde_json::to_string_pretty(&engine.reconcile_all())?
        }
        Command::Explain { rule_id, product_id } => {
            let rule = store
                .get(&rule_id)
                .with_context(|| format!("规则不存在: {}", rule_id))?;
            match matcher.explain(&rule, product_id)? {
                Some(result) => serde_json::to_string_pretty(&result)?,
                None => bail!("商品不存在: {}", product_id),
            }
        }
    };
    println!("{}", output);

    if let Some(rendered) = guard.render_metrics() {
        eprintln!("{}", rendered);
    }
    Ok(())
}
