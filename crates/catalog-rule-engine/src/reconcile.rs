//! 目标成员同步
//!
//! 让目标（分类、Feed、关联商品等）存储的成员集合与其规则的实时匹配结果保持一致：
//! 目标下多条启用规则的匹配集合取交集，与当前成员对比得到差异后写回。
//! 同一目标的同步通过目标级互斥锁串行化，不同目标可以并发。

use catalog_shared::config::{EmptyRulePolicy, ReconciliationConfig};
use catalog_shared::observability::metrics as engine_metrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::attribute::AttributeMetadata;
use crate::catalog::CatalogSource;
use crate::error::{Result, RuleError};
use crate::matcher::{RuleMatcher, ScanBudget, Scope, Strategy};
use crate::models::{MatchResult, ProductId, ReconciliationDiff, Rule, RuleWarning, TargetRef};
use crate::store::RuleProvider;

/// 目标成员存储
#[cfg_attr(test, mockall::automock)]
pub trait MembershipStore: Send + Sync {
    fn members(&self, target: &TargetRef) -> Result<BTreeSet<ProductId>>;

    fn is_member(&self, target: &TargetRef, product_id: ProductId) -> Result<bool>;

    /// 新增成员，附带排序位置
    fn add_members(&self, target: &TargetRef, members: &[(ProductId, i32)]) -> Result<()>;

    fn remove_members(&self, target: &TargetRef, product_ids: &[ProductId]) -> Result<()>;

    /// 成员变化后使以目标为键的缓存失效
    fn invalidate_cache(&self, target: &TargetRef);
}

/// 内存成员存储
#[derive(Debug, Default)]
pub struct MemoryMembershipStore {
    members: DashMap<TargetRef, BTreeMap<ProductId, i32>>,
    invalidations: Mutex<Vec<TargetRef>>,
}

impl MemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members(self, target: TargetRef, ids: impl IntoIterator<Item = ProductId>) -> Self {
        self.members
            .entry(target)
            .or_default()
            .extend(ids.into_iter().map(|id| (id, 0)));
        self
    }

    /// 成员及其排序位置
    pub fn positions(&self, target: &TargetRef) -> BTreeMap<ProductId, i32> {
        self.members
            .get(target)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// 缓存失效记录（按发生顺序）
    pub fn invalidations(&self) -> Vec<TargetRef> {
        self.invalidations.lock().clone()
    }
}

impl MembershipStore for MemoryMembershipStore {
    fn members(&self, target: &TargetRef) -> Result<BTreeSet<ProductId>> {
        Ok(self
            .members
            .get(target)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    fn is_member(&self, target: &TargetRef, product_id: ProductId) -> Result<bool> {
        Ok(self
            .members
            .get(target)
            .is_some_and(|m| m.contains_key(&product_id)))
    }

    fn add_members(&self, target: &TargetRef, members: &[(ProductId, i32)]) -> Result<()> {
        let mut entry = self.members.entry(*target).or_default();
        for (id, position) in members {
            entry.entry(*id).or_insert(*position);
        }
        Ok(())
    }

    fn remove_members(&self, target: &TargetRef, product_ids: &[ProductId]) -> Result<()> {
        if let Some(mut entry) = self.members.get_mut(target) {
            for id in product_ids {
                entry.remove(id);
            }
        }
        Ok(())
    }

    fn invalidate_cache(&self, target: &TargetRef) {
        self.invalidations.lock().push(*target);
    }
}

/// 目标级互斥锁
#[derive(Debug, Default)]
pub struct TargetLocks {
    locks: DashMap<TargetRef, Arc<Mutex<()>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, target: &TargetRef) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(*target).or_default().value())
    }
}

/// 同步参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub budget: ScanBudget,
    /// 新增成员的排序位置
    pub default_position: i32,
    pub stock_id: i64,
    pub empty_rule_policy: EmptyRulePolicy,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self::from(&ReconciliationConfig::default())
    }
}

impl From<&ReconciliationConfig> for ReconcileSettings {
    fn from(config: &ReconciliationConfig) -> Self {
        Self {
            budget: ScanBudget {
                max_rows: config.max_rows,
                max_duration: config.max_duration_ms.map(Duration::from_millis),
            },
            default_position: config.default_position,
            stock_id: config.stock_id,
            empty_rule_policy: config.empty_rule_policy,
        }
    }
}

/// 单个目标的同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    /// 有差异并已写回
    Synced,
    /// 已一致，无需写入
    Unchanged,
    /// 没有启用规则，按策略保持不变
    Skipped,
}

impl ReconcileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Unchanged => "unchanged",
            Self::Skipped => "skipped",
        }
    }
}

/// 单个目标的同步结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetReport {
    pub target: TargetRef,
    pub status: ReconcileStatus,
    pub rules_evaluated: usize,
    pub added: BTreeSet<ProductId>,
    pub removed: BTreeSet<ProductId>,
    pub warnings: Vec<RuleWarning>,
}

impl TargetReport {
    fn skipped(target: TargetRef) -> Self {
        Self {
            target,
            status: ReconcileStatus::Skipped,
            rules_evaluated: 0,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }
}

/// 同步失败的目标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetFailure {
    pub target: TargetRef,
    pub code: String,
    pub message: String,
}

/// 批量同步汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub synced: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: Vec<TargetFailure>,
    pub added: usize,
    pub removed: usize,
    pub reports: Vec<TargetReport>,
}

impl ReconcileSummary {
    fn record(&mut self, outcome: (TargetRef, Result<TargetReport>)) {
        match outcome {
            (_, Ok(report)) => {
                match report.status {
                    ReconcileStatus::Synced => self.synced += 1,
                    ReconcileStatus::Unchanged => self.unchanged += 1,
                    ReconcileStatus::Skipped => self.skipped += 1,
                }
                self.added += report.added.len();
                self.removed += report.removed.len();
                self.reports.push(report);
            }
            (target, Err(e)) => {
                error!(target_ref = %target, code = e.code(), error = %e, "目标同步失败");
                engine_metrics::record_reconciliation("failed", 0, 0);
                self.failed.push(TargetFailure {
                    target,
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    pub fn succeeded(&self) -> usize {
        self.synced + self.unchanged + self.skipped
    }
}

/// 成员同步引擎
pub struct ReconciliationEngine {
    metadata: Arc<dyn AttributeMetadata>,
    catalog: Arc<dyn CatalogSource>,
    rules: Arc<dyn RuleProvider>,
    membership: Arc<dyn MembershipStore>,
    settings: ReconcileSettings,
    locks: TargetLocks,
}

impl ReconciliationEngine {
    pub fn new(
        metadata: Arc<dyn AttributeMetadata>,
        catalog: Arc<dyn CatalogSource>,
        rules: Arc<dyn RuleProvider>,
        membership: Arc<dyn MembershipStore>,
    ) -> Self {
        Self {
            metadata,
            catalog,
            rules,
            membership,
            settings: ReconcileSettings::default(),
            locks: TargetLocks::new(),
        }
    }

    pub fn with_settings(mut self, settings: ReconcileSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    fn matcher(&self) -> RuleMatcher<'_> {
        RuleMatcher::new(self.metadata.as_ref(), self.catalog.as_ref())
            .with_stock_id(self.settings.stock_id)
            .with_budget(self.settings.budget)
    }

    /// 全量同步一个目标
    ///
    /// 每条规则都逐行评估（逐对象路径是权威结果），多条规则取交集。
    #[instrument(skip(self), fields(target_ref = %target))]
    pub fn reconcile_target(&self, target: &TargetRef) -> Result<TargetReport> {
        let lock = self.locks.lock_for(target);
        let _guard = lock.lock();

        let rules = self.rules.active_rules_for(target);
        let mut warnings = Vec::new();

        let effective = if rules.is_empty() {
            match self.settings.empty_rule_policy {
                EmptyRulePolicy::LeaveUntouched => {
                    debug!("目标下没有启用规则，保持成员不变");
                    engine_metrics::record_reconciliation("skipped", 0, 0);
                    return Ok(TargetReport::skipped(*target));
                }
                EmptyRulePolicy::ClearMembership => MatchResult::new(),
            }
        } else {
            self.intersect(&rules, Scope::All, Strategy::PerObject, &mut warnings)?
        };

        let current = self.membership.members(target)?;
        let diff = ReconciliationDiff::compute(&effective, &current);
        self.apply(target, &diff)?;

        let report = self.report(*target, rules.len(), diff, warnings);
        info!(
            rules = report.rules_evaluated,
            matched = effective.len(),
            added = report.added.len(),
            removed = report.removed.len(),
            "目标同步完成"
        );
        Ok(report)
    }

    /// 单个商品变化后的增量同步
    ///
    /// 只在该商品上评估目标的规则，结果与限定到该商品的全量同步一致。
    #[instrument(skip(self), fields(target_ref = %target))]
    pub fn reconcile_product(&self, target: &TargetRef, product_id: ProductId) -> Result<TargetReport> {
        let lock = self.locks.lock_for(target);
        let _guard = lock.lock();

        let rules = self.rules.active_rules_for(target);
        let mut warnings = Vec::new();

        let effective = if rules.is_empty() {
            match self.settings.empty_rule_policy {
                EmptyRulePolicy::LeaveUntouched => return Ok(TargetReport::skipped(*target)),
                EmptyRulePolicy::ClearMembership => MatchResult::new(),
            }
        } else {
            self.intersect(&rules, Scope::Product(product_id), Strategy::Auto, &mut warnings)?
        };

        let current: BTreeSet<ProductId> = if self.membership.is_member(target, product_id)? {
            BTreeSet::from([product_id])
        } else {
            BTreeSet::new()
        };
        let diff = ReconciliationDiff::compute(&effective, &current);
        self.apply(target, &diff)?;

        Ok(self.report(*target, rules.len(), diff, warnings))
    }

    /// 同步所有挂有规则的目标，单个目标失败不影响其他目标
    #[instrument(skip(self))]
    pub fn reconcile_all(&self) -> ReconcileSummary {
        self.reconcile_targets(&self.rules.targets())
    }

    pub fn reconcile_targets(&self, targets: &[TargetRef]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for target in targets {
            summary.record((*target, self.reconcile_target(target)));
        }
        info!(
            synced = summary.synced,
            unchanged = summary.unchanged,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            "批量同步完成"
        );
        summary
    }

    /// 单个商品变化后，在所有目标上做增量同步
    #[instrument(skip(self))]
    pub fn reconcile_product_everywhere(&self, product_id: ProductId) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for target in self.rules.targets() {
            summary.record((target, self.reconcile_product(&target, product_id)));
        }
        summary
    }

    /// 多条规则匹配集合的交集
    fn intersect(
        &self,
        rules: &[Rule],
        scope: Scope,
        strategy: Strategy,
        warnings: &mut Vec<RuleWarning>,
    ) -> Result<MatchResult> {
        let matcher = self.matcher();
        let mut effective: Option<MatchResult> = None;

        for rule in rules {
            let outcome = matcher.match_ids(rule, scope, strategy, None)?;
            warnings.extend(outcome.warnings);

            let next = match effective {
                None => (*outcome.ids).clone(),
                Some(current) => current.intersection(&outcome.ids).copied().collect(),
            };
            if next.is_empty() {
                debug!(rule_id = %rule.id, "交集为空，跳过剩余规则");
                return Ok(next);
            }
            effective = Some(next);
        }

        Ok(effective.unwrap_or_default())
    }

    /// 写回差异并使缓存失效
    ///
    /// 只要有一步写入成功就使缓存失效，后续步骤失败时也一样。
    fn apply(&self, target: &TargetRef, diff: &ReconciliationDiff) -> Result<()> {
        if diff.is_empty() {
            return Ok(());
        }

        let mut written = false;
        let result = self.write_diff(target, diff, &mut written);
        if written {
            self.membership.invalidate_cache(target);
        }
        if result.is_err() && written {
            warn!(target_ref = %target, "成员只写入了一部分");
        }
        result
    }

    fn write_diff(
        &self,
        target: &TargetRef,
        diff: &ReconciliationDiff,
        written: &mut bool,
    ) -> Result<()> {
        if !diff.to_remove.is_empty() {
            let ids: Vec<ProductId> = diff.to_remove.iter().copied().collect();
            self.membership
                .remove_members(target, &ids)
                .map_err(|e| write_failure(target, e))?;
            *written = true;
        }

        if !diff.to_add.is_empty() {
            let members: Vec<(ProductId, i32)> = diff
                .to_add
                .iter()
                .map(|id| (*id, self.settings.default_position))
                .collect();
            self.membership
                .add_members(target, &members)
                .map_err(|e| write_failure(target, e))?;
            *written = true;
        }

        Ok(())
    }

    fn report(
        &self,
        target: TargetRef,
        rules_evaluated: usize,
        diff: ReconciliationDiff,
        warnings: Vec<RuleWarning>,
    ) -> TargetReport {
        let status = if diff.is_empty() {
            ReconcileStatus::Unchanged
        } else {
            ReconcileStatus::Synced
        };
        engine_metrics::record_reconciliation(status.as_str(), diff.to_add.len(), diff.to_remove.len());

        TargetReport {
            target,
            status,
            rules_evaluated,
            added: diff.to_add,
            removed: diff.to_remove,
            warnings,
        }
    }
}

fn write_failure(target: &TargetRef, error: RuleError) -> RuleError {
    match error {
        RuleError::TargetWriteFailure { .. } => error,
        other => RuleError::TargetWriteFailure {
            target: target.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttributeMeta, InMemoryAttributeCatalog};
    use crate::catalog::{MemoryCatalog, ProductRecord};
    use crate::models::{CombineNode, ConditionNode};
    use crate::operators::Operator;
    use crate::store::RuleStore;
    use serde_json::{json, Map};

    fn catalog(prices: &[(ProductId, i64)]) -> Arc<MemoryCatalog> {
        let catalog = MemoryCatalog::new();
        for (id, price) in prices {
            let mut attributes = Map::new();
            attributes.insert("price".to_string(), json!(price));
            catalog.upsert_product(ProductRecord {
                id: *id,
                attributes,
                ..Default::default()
            });
        }
        Arc::new(catalog)
    }

    fn price_rule(id: &str, target: TargetRef, operator: Operator, value: i64) -> Rule {
        Rule::new(
            id,
            target,
            CombineNode::all(vec![ConditionNode::new("price", operator, value).into()]),
        )
        .with_id(id)
    }

    fn engine(
        catalog: Arc<MemoryCatalog>,
        rules: RuleStore,
        membership: Arc<dyn MembershipStore>,
    ) -> ReconciliationEngine {
        let metadata = Arc::new(InMemoryAttributeCatalog::from_attributes([
            AttributeMeta::numeric("price"),
        ]));
        ReconciliationEngine::new(metadata, catalog, Arc::new(rules), membership)
    }

    #[test]
    fn test_single_rule_diff() {
        let target = TargetRef::category(20);
        let catalog = catalog(&[(1, 10), (2, 20), (3, 30), (4, 40)]);
        let rules = RuleStore::new();
        rules.load(price_rule("r1", target, Operator::Gteq, 20)).unwrap();
        let membership = Arc::new(MemoryMembershipStore::new().with_members(target, [1, 2, 3]));

        let engine = engine(catalog, rules, membership.clone());
        let report = engine.reconcile_target(&target).unwrap();

        assert_eq!(report.status, ReconcileStatus::Synced);
        assert_eq!(report.added, BTreeSet::from([4]));
        assert_eq!(report.removed, BTreeSet::from([1]));
        assert_eq!(membership.members(&target).unwrap(), BTreeSet::from([2, 3, 4]));
        assert_eq!(membership.invalidations(), vec![target]);
    }

    #[test]
    fn test_multiple_rules_intersect() {
        let target = TargetRef::category(20);
        let catalog = catalog(&[(1, 10), (2, 20), (3, 30), (4, 40)]);
        let rules = RuleStore::new();
        rules.load(price_rule("a", target, Operator::Lteq, 30)).unwrap();
        rules.load(price_rule("b", target, Operator::Gteq, 20)).unwrap();
        let membership = Arc::new(MemoryMembershipStore::new());

        let engine = engine(catalog, rules, membership.clone());
        engine.reconcile_target(&target).unwrap();

        assert_eq!(membership.members(&target).unwrap(), BTreeSet::from([2, 3]));
    }

    #[test]
    fn test_in_sync_target_is_not_written() {
        let target = TargetRef::category(20);
        let catalog = catalog(&[(1, 10), (2, 20)]);
        let rules = RuleStore::new();
        rules.load(price_rule("r1", target, Operator::Gt, 15)).unwrap();
        let membership = Arc::new(MemoryMembershipStore::new().with_members(target, [2]));

        let engine = engine(catalog, rules, membership.clone());
        let report = engine.reconcile_target(&target).unwrap();

        assert_eq!(report.status, ReconcileStatus::Unchanged);
        assert!(membership.invalidations().is_empty());
    }

    #[test]
    fn test_new_members_get_default_position() {
        let target = TargetRef::category(20);
        let catalog = catalog(&[(1, 10)]);
        let rules = RuleStore::new();
        rules.load(price_rule("r1", target, Operator::Gt, 0)).unwrap();
        let membership = Arc::new(MemoryMembershipStore::new());

        let settings = ReconcileSettings {
            default_position: 7,
            ..ReconcileSettings::default()
        };
        let engine = engine(catalog, rules, membership.clone()).with_settings(settings);
        engine.reconcile_target(&target).unwrap();

        assert_eq!(membership.positions(&target), BTreeMap::from([(1, 7)]));
    }

    #[test]
    fn test_zero_rule_policy() {
        let target = TargetRef::category(20);
        let membership = Arc::new(MemoryMembershipStore::new().with_members(target, [1, 2]));

        let engine = engine(catalog(&[(1, 10)]), RuleStore::new(), membership.clone());
        let report = engine.reconcile_target(&target).unwrap();
        assert_eq!(report.status, ReconcileStatus::Skipped);
        assert_eq!(membership.members(&target).unwrap().len(), 2);

        let settings = ReconcileSettings {
            empty_rule_policy: EmptyRulePolicy::ClearMembership,
            ..ReconcileSettings::default()
        };
        let engine =
            engine_with(catalog(&[(1, 10)]), RuleStore::new(), membership.clone(), settings);
        engine.reconcile_target(&target).unwrap();
        assert!(membership.members(&target).unwrap().is_empty());
    }

    fn engine_with(
        catalog: Arc<MemoryCatalog>,
        rules: RuleStore,
        membership: Arc<dyn MembershipStore>,
        settings: ReconcileSettings,
    ) -> ReconciliationEngine {
        engine(catalog, rules, membership).with_settings(settings)
    }

    #[test]
    fn test_incremental_matches_full_restricted() {
        let target = TargetRef::category(20);
        let catalog = catalog(&[(1, 10), (2, 20), (3, 30)]);
        let rules = RuleStore::new();
        rules.load(price_rule("r1", target, Operator::Gteq, 20)).unwrap();
        let membership = Arc::new(MemoryMembershipStore::new().with_members(target, [1, 2]));

        let engine = engine(catalog.clone(), rules, membership.clone());

        // 商品 1 涨价后应加入，商品 3 不变仍应加入
        catalog.set_attribute(1, "price", json!(25));
        engine.reconcile_product(&target, 1).unwrap();
        engine.reconcile_product(&target, 3).unwrap();
        assert_eq!(membership.members(&target).unwrap(), BTreeSet::from([1, 2, 3]));

        // 商品 2 降价后应移除
        catalog.set_attribute(2, "price", json!(5));
        let report = engine.reconcile_product(&target, 2).unwrap();
        assert_eq!(report.removed, BTreeSet::from([2]));

        let full = engine.reconcile_target(&target).unwrap();
        assert_eq!(full.status, ReconcileStatus::Unchanged);
    }

    #[test]
    fn test_write_failure_is_isolated_per_target() {
        let good = TargetRef::category(1);
        let bad = TargetRef::category(2);
        let catalog = catalog(&[(1, 10), (2, 20)]);
        let rules = RuleStore::new();
        rules.load(price_rule("good", good, Operator::Gt, 0)).unwrap();
        rules.load(price_rule("bad", bad, Operator::Gt, 0)).unwrap();

        let mut store = MockMembershipStore::new();
        store.expect_members().returning(|_| Ok(BTreeSet::new()));
        store
            .expect_add_members()
            .withf(move |target, _| *target == bad)
            .returning(|_, _| Err(RuleError::SourceError("deadlock".to_string())));
        store
            .expect_add_members()
            .withf(move |target, _| *target == good)
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_invalidate_cache()
            .withf(move |target| *target == good)
            .times(1)
            .return_const(());

        let engine = engine(catalog, rules, Arc::new(store));
        let summary = engine.reconcile_all();

        assert_eq!(summary.synced, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].target, bad);
        assert_eq!(summary.failed[0].code, "TARGET_WRITE_FAILURE");
        assert_eq!(summary.added, 2);
    }

    #[test]
    fn test_partial_write_still_invalidates_cache() {
        let target = TargetRef::category(20);
        let catalog = catalog(&[(1, 10), (2, 20)]);
        let rules = RuleStore::new();
        rules.load(price_rule("r1", target, Operator::Gt, 15)).unwrap();

        let mut store = MockMembershipStore::new();
        store
            .expect_members()
            .returning(|_| Ok(BTreeSet::from([1])));
        store
            .expect_remove_members()
            .withf(|_, ids| ids == [1].as_slice())
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_add_members()
            .times(1)
            .returning(|_, _| Err(RuleError::SourceError("connection reset".to_string())));
        store
            .expect_invalidate_cache()
            .withf(move |t| *t == target)
            .times(1)
            .return_const(());

        let engine = engine(catalog, rules, Arc::new(store));
        let err = engine.reconcile_target(&target).unwrap_err();
        assert_eq!(err.code(), "TARGET_WRITE_FAILURE");
    }

    #[test]
    fn test_failed_first_write_skips_invalidation() {
        let target = TargetRef::category(20);
        let catalog = catalog(&[(1, 10)]);
        let rules = RuleStore::new();
        rules.load(price_rule("r1", target, Operator::Gt, 15)).unwrap();

        let mut store = MockMembershipStore::new();
        store
            .expect_members()
            .returning(|_| Ok(BTreeSet::from([1])));
        store
            .expect_remove_members()
            .returning(|_, _| Err(RuleError::SourceError("lock timeout".to_string())));
        store.expect_invalidate_cache().never();

        let engine = engine(catalog, rules, Arc::new(store));
        assert!(engine.reconcile_target(&target).is_err());
    }

    #[test]
    fn test_report_carries_malformed_tree_warning() {
        let target = TargetRef::category(20);
        let rules = RuleStore::new();
        rules
            .load_from_json(
                r#"{"id": "corrupt", "name": "corrupt", "target": {"kind": "category", "id": 20},
                    "root": {"aggregator": "sometimes"}}"#,
            )
            .unwrap();
        let membership = Arc::new(MemoryMembershipStore::new().with_members(target, [1]));

        let engine = engine(catalog(&[(1, 10)]), rules, membership.clone());
        let report = engine.reconcile_target(&target).unwrap();

        assert_eq!(report.removed, BTreeSet::from([1]));
        assert!(matches!(
            report.warnings.as_slice(),
            [RuleWarning::MalformedTree { .. }]
        ));
    }

    #[test]
    fn test_budget_failure_is_reported() {
        let target = TargetRef::category(20);
        let catalog = catalog(&[(1, 10), (2, 20), (3, 30)]);
        let rules = RuleStore::new();
        rules.load(price_rule("r1", target, Operator::Gt, 0)).unwrap();
        let membership = Arc::new(MemoryMembershipStore::new());

        let settings = ReconcileSettings {
            budget: ScanBudget::unlimited().with_max_rows(1),
            ..ReconcileSettings::default()
        };
        let engine = engine_with(catalog, rules, membership.clone(), settings);
        let summary = engine.reconcile_all();

        assert_eq!(summary.failed[0].code, "BUDGET_EXCEEDED");
        assert!(membership.members(&target).unwrap().is_empty());
    }

    #[test]
    fn test_settings_from_config() {
        let config = ReconciliationConfig {
            max_rows: Some(100),
            max_duration_ms: Some(250),
            ..ReconciliationConfig::default()
        };
        let settings = ReconcileSettings::from(&config);
        assert_eq!(settings.budget.max_rows, Some(100));
        assert_eq!(settings.budget.max_duration, Some(Duration::from_millis(250)));
        assert_eq!(settings.stock_id, 1);
        assert_eq!(settings.empty_rule_policy, EmptyRulePolicy::LeaveUntouched);
    }
}
