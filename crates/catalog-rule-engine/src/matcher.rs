//! 规则匹配
//!
//! [`RuleMatcher`] 计算一条规则在商品数据源上的匹配集合。规则树可以展开为一层结构时
//! 默认走谓词下推，否则逐行评估；两条路径对同一棵树和同一份数据的结果一致。

use catalog_shared::observability::metrics as engine_metrics;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::attribute::{AttributeMetadata, AttributeResolver};
use crate::catalog::CatalogSource;
use crate::compiler::{FlatRule, PredicateCompiler};
use crate::error::{Result, RuleError};
use crate::executor::{EvaluationResult, PreparedTree, RequirementCollector, RuleExecutor};
use crate::models::{MatchResult, ProductId, Rule, RuleWarning};
use crate::product::{ProductRow, ProductView};
use crate::query::{Projection, QueryBuilder};
use crate::session::{EvaluationSession, SessionEntry, SessionKey};

/// 评估策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 可展开时下推，否则逐对象
    #[default]
    Auto,
    /// 逐对象评估
    PerObject,
    /// 谓词下推，不可展开时回退到逐对象
    Compiled,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::PerObject => "per_object",
            Self::Compiled => "compiled",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 评估范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    /// 只评估单个商品（增量同步）
    Product(ProductId),
}

impl Scope {
    pub fn product_id(&self) -> Option<ProductId> {
        match self {
            Self::All => None,
            Self::Product(id) => Some(*id),
        }
    }
}

/// 全量扫描预算
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanBudget {
    pub max_rows: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl ScanBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    fn start(&self) -> BudgetTracker {
        BudgetTracker {
            budget: *self,
            started: Instant::now(),
            rows: 0,
        }
    }
}

struct BudgetTracker {
    budget: ScanBudget,
    started: Instant,
    rows: u64,
}

impl BudgetTracker {
    fn tick(&mut self, rule_id: &str) -> Result<()> {
        self.rows += 1;
        if let Some(max_rows) = self.budget.max_rows {
            if self.rows > max_rows {
                return Err(RuleError::BudgetExceeded(format!(
                    "规则 {} 扫描超过 {} 行",
                    rule_id, max_rows
                )));
            }
        }
        if let Some(max_duration) = self.budget.max_duration {
            if self.started.elapsed() > max_duration {
                return Err(RuleError::BudgetExceeded(format!(
                    "规则 {} 扫描超过 {} ms",
                    rule_id,
                    max_duration.as_millis()
                )));
            }
        }
        Ok(())
    }
}

/// 匹配结果
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub ids: Arc<MatchResult>,
    pub warnings: Vec<RuleWarning>,
    /// 实际使用的策略（Auto 会被解析为具体策略）
    pub strategy_used: Strategy,
    pub scanned_rows: u64,
    /// 是否来自评估会话缓存
    pub cached: bool,
}

/// 规则预览：提交前展示给规则编辑者的匹配数量与警告
#[derive(Debug, Clone, Serialize)]
pub struct RulePreview {
    pub rule_id: String,
    pub matched_count: usize,
    pub strategy: Strategy,
    pub warnings: Vec<RuleWarning>,
}

/// 规则匹配器
pub struct RuleMatcher<'a> {
    metadata: &'a dyn AttributeMetadata,
    catalog: &'a dyn CatalogSource,
    stock_id: i64,
    budget: ScanBudget,
}

impl<'a> RuleMatcher<'a> {
    pub fn new(metadata: &'a dyn AttributeMetadata, catalog: &'a dyn CatalogSource) -> Self {
        Self {
            metadata,
            catalog,
            stock_id: 1,
            budget: ScanBudget::unlimited(),
        }
    }

    pub fn with_stock_id(mut self, stock_id: i64) -> Self {
        self.stock_id = stock_id;
        self
    }

    pub fn with_budget(mut self, budget: ScanBudget) -> Self {
        self.budget = budget;
        self
    }

    /// 计算规则的匹配集合
    ///
    /// 提供会话时先查缓存，未命中则计算后写入。
    #[instrument(skip(self, rule, session), fields(rule_id = %rule.id, target_ref = %rule.target))]
    pub fn match_ids(
        &self,
        rule: &Rule,
        scope: Scope,
        strategy: Strategy,
        session: Option<&EvaluationSession>,
    ) -> Result<MatchOutcome> {
        let key = SessionKey {
            rule_id: rule.id.clone(),
            scope: scope.product_id(),
        };

        if let Some(cached) = session.and_then(|s| s.get(&key)) {
            debug!(matched = cached.ids.len(), "命中评估会话缓存");
            return Ok(MatchOutcome {
                ids: cached.ids,
                warnings: cached.warnings,
                strategy_used: cached.strategy,
                scanned_rows: 0,
                cached: true,
            });
        }

        let start = Instant::now();
        let evaluation = self.evaluate(rule, scope, strategy)?;
        let elapsed = start.elapsed();

        engine_metrics::record_rule_evaluation(
            evaluation.strategy.as_str(),
            evaluation.ids.len(),
            elapsed.as_secs_f64(),
        );
        debug!(
            matched = evaluation.ids.len(),
            scanned = evaluation.scanned_rows,
            strategy = %evaluation.strategy,
            elapsed_ms = elapsed.as_millis() as u64,
            "规则评估完成"
        );

        let entry = SessionEntry::new(evaluation.ids, evaluation.strategy, evaluation.warnings);
        let entry = match session {
            Some(session) => session.insert(key, entry),
            None => entry,
        };

        Ok(MatchOutcome {
            ids: entry.ids,
            warnings: entry.warnings,
            strategy_used: entry.strategy,
            scanned_rows: evaluation.scanned_rows,
            cached: false,
        })
    }

    /// 预览匹配数量，不写入任何数据
    pub fn preview(&self, rule: &Rule) -> Result<RulePreview> {
        let outcome = self.match_ids(rule, Scope::All, Strategy::Auto, None)?;
        Ok(RulePreview {
            rule_id: rule.id.clone(),
            matched_count: outcome.ids.len(),
            strategy: outcome.strategy_used,
            warnings: outcome.warnings,
        })
    }

    /// 解释单个商品的评估过程，商品不存在时返回 None
    pub fn explain(&self, rule: &Rule, product_id: ProductId) -> Result<Option<EvaluationResult>> {
        let resolver = AttributeResolver::new(self.metadata);
        let projection = self.projection_for(rule);
        let source = self.load_source(rule, &projection)?;

        let Some(product) = self.catalog.load(product_id, &projection)? else {
            return Ok(None);
        };
        let prepared = PreparedTree::prepare(&rule.root, &resolver, source_view(&source));
        Ok(Some(RuleExecutor::new().with_trace().execute(&prepared, &product)))
    }

    fn projection_for(&self, rule: &Rule) -> Projection {
        let mut collector = RequirementCollector::new();
        rule.root.describe_requirements(&mut collector);
        collector.into_projection(self.stock_id)
    }

    /// 关联商品规则的参照商品
    fn load_source(&self, rule: &Rule, projection: &Projection) -> Result<Option<ProductRow>> {
        let Some(source_id) = rule.target.source_product() else {
            return Ok(None);
        };
        let source = self.catalog.load(source_id, projection)?;
        if source.is_none() {
            warn!(source_id, "参照商品不存在，参照比较条件不匹配任何商品");
        }
        Ok(source)
    }

    fn evaluate(&self, rule: &Rule, scope: Scope, strategy: Strategy) -> Result<Evaluation> {
        let resolver = AttributeResolver::new(self.metadata);
        let projection = self.projection_for(rule);
        let source = self.load_source(rule, &projection)?;

        let flat = match strategy {
            Strategy::PerObject => None,
            Strategy::Auto | Strategy::Compiled => FlatRule::from_tree(&rule.root),
        };
        if strategy == Strategy::Compiled && flat.is_none() {
            debug!("规则树无法展开为一层结构，回退到逐对象评估");
        }

        let mut query = QueryBuilder::new();
        if let Scope::Product(id) = scope {
            query.restrict_ids([id]);
        }

        let (prepared, compile_warnings, used) = match &flat {
            Some(flat) => {
                query.project(Projection::ids_only());
                let report = PredicateCompiler::new(&resolver, self.stock_id).apply(
                    flat,
                    source_view(&source),
                    &mut query,
                );
                (None, report.warnings, Strategy::Compiled)
            }
            None => {
                query.project(projection);
                let prepared = PreparedTree::prepare(&rule.root, &resolver, source_view(&source));
                let warnings = prepared.warnings().to_vec();
                (Some(prepared), warnings, Strategy::PerObject)
            }
        };

        // 加载时的警告（如规则树格式错误）排在评估警告之前
        let mut warnings = rule.load_warnings.clone();
        warnings.extend(compile_warnings);

        let mut tracker = self.budget.start();
        let mut ids = MatchResult::new();
        for row in self.catalog.stream(&query)? {
            let row = row?;
            tracker.tick(&rule.id)?;
            let matched = match &prepared {
                Some(prepared) => prepared.matches(&row),
                None => true,
            };
            if matched {
                ids.insert(row.id);
            }
        }

        Ok(Evaluation {
            ids,
            warnings,
            strategy: used,
            scanned_rows: tracker.rows,
        })
    }
}

struct Evaluation {
    ids: MatchResult,
    warnings: Vec<RuleWarning>,
    strategy: Strategy,
    scanned_rows: u64,
}

fn source_view(source: &Option<ProductRow>) -> Option<&dyn ProductView> {
    source.as_ref().map(|row| row as &dyn ProductView)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttributeMeta, InMemoryAttributeCatalog};
    use crate::catalog::{MemoryCatalog, ProductRecord};
    use crate::models::{CombineNode, ConditionNode, TargetKind, TargetRef};
    use crate::operators::Operator;
    use crate::product::StockItem;
    use serde_json::{json, Map};

    fn attributes() -> InMemoryAttributeCatalog {
        InMemoryAttributeCatalog::from_attributes([
            AttributeMeta::select("color", &[(10, "Red"), (12, "Blue")]),
            AttributeMeta::numeric("price"),
        ])
    }

    fn catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        for (id, color, price) in [(1, 10, 50), (2, 12, 150), (3, 10, 250), (4, 12, 350)] {
            let mut attributes = Map::new();
            attributes.insert("color".to_string(), json!(color));
            attributes.insert("price".to_string(), json!(price));
            catalog.upsert_product(ProductRecord {
                id,
                type_id: Some("simple".to_string()),
                visibility: Some(4),
                attributes,
            });
        }
        catalog.link_category(5, 1);
        catalog.link_category(5, 3);
        catalog.link_category(9, 4);
        catalog.set_stock(StockItem::new(3, 1, 0.0, false));
        catalog
    }

    fn rule(root: CombineNode) -> Rule {
        Rule::new("test", TargetRef::category(20), root).with_id("r1")
    }

    fn ids(values: &[ProductId]) -> MatchResult {
        values.iter().copied().collect()
    }

    #[test]
    fn test_auto_uses_compiled_for_flat_tree() {
        let attributes = attributes();
        let catalog = catalog();
        let matcher = RuleMatcher::new(&attributes, &catalog);
        let rule = rule(CombineNode::all(vec![
            ConditionNode::new("color", Operator::Eq, "Red").into(),
            ConditionNode::new("price", Operator::Gt, 100).into(),
        ]));

        let outcome = matcher.match_ids(&rule, Scope::All, Strategy::Auto, None).unwrap();
        assert_eq!(outcome.strategy_used, Strategy::Compiled);
        assert_eq!(*outcome.ids, ids(&[3]));

        let per_object = matcher
            .match_ids(&rule, Scope::All, Strategy::PerObject, None)
            .unwrap();
        assert_eq!(per_object.strategy_used, Strategy::PerObject);
        assert_eq!(per_object.ids, outcome.ids);
    }

    #[test]
    fn test_compiled_falls_back_for_nested_tree() {
        let attributes = attributes();
        let catalog = catalog();
        let matcher = RuleMatcher::new(&attributes, &catalog);
        let rule = rule(
            CombineNode::any(vec![ConditionNode::new("category_ids", Operator::In, json!([5])).into()])
                .negated(),
        );

        let outcome = matcher
            .match_ids(&rule, Scope::All, Strategy::Compiled, None)
            .unwrap();
        assert_eq!(outcome.strategy_used, Strategy::PerObject);
        assert_eq!(*outcome.ids, ids(&[2, 4]));
    }

    #[test]
    fn test_scope_restricts_to_one_product() {
        let attributes = attributes();
        let catalog = catalog();
        let matcher = RuleMatcher::new(&attributes, &catalog);
        let rule = rule(CombineNode::all(vec![
            ConditionNode::new("price", Operator::Gt, 100).into(),
        ]));

        for strategy in [Strategy::PerObject, Strategy::Compiled] {
            let hit = matcher.match_ids(&rule, Scope::Product(2), strategy, None).unwrap();
            assert_eq!(*hit.ids, ids(&[2]));
            assert!(hit.scanned_rows <= 1);

            let miss = matcher.match_ids(&rule, Scope::Product(1), strategy, None).unwrap();
            assert!(miss.ids.is_empty());
        }
    }

    #[test]
    fn test_session_caches_results() {
        let attributes = attributes();
        let catalog = catalog();
        let matcher = RuleMatcher::new(&attributes, &catalog);
        let session = EvaluationSession::new();
        let rule = rule(CombineNode::all(vec![
            ConditionNode::new("color", Operator::Eq, 12).into(),
        ]));

        let first = matcher
            .match_ids(&rule, Scope::All, Strategy::Auto, Some(&session))
            .unwrap();
        let second = matcher
            .match_ids(&rule, Scope::All, Strategy::Auto, Some(&session))
            .unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert!(Arc::ptr_eq(&first.ids, &second.ids));
        assert_eq!(second.strategy_used, Strategy::Compiled);
    }

    #[test]
    fn test_session_hit_keeps_strategy_and_warnings() {
        let attributes = attributes();
        let catalog = catalog();
        let matcher = RuleMatcher::new(&attributes, &catalog);
        let session = EvaluationSession::new();
        let rule = rule(CombineNode::all(vec![
            CombineNode::any(vec![
                ConditionNode::new("removed_attr", Operator::Eq, 1).into(),
                CombineNode::all(vec![ConditionNode::new("price", Operator::Gt, 100).into()])
                    .into(),
            ])
            .into(),
        ]));

        let first = matcher
            .match_ids(&rule, Scope::All, Strategy::Auto, Some(&session))
            .unwrap();
        let second = matcher
            .match_ids(&rule, Scope::All, Strategy::Auto, Some(&session))
            .unwrap();

        assert_eq!(first.strategy_used, Strategy::PerObject);
        assert!(second.cached);
        assert_eq!(second.strategy_used, Strategy::PerObject);
        assert_eq!(second.warnings, first.warnings);
        assert_eq!(second.warnings.len(), 1);
    }

    #[test]
    fn test_preview_reports_malformed_stored_tree() {
        let attributes = attributes();
        let catalog = catalog();
        let matcher = RuleMatcher::new(&attributes, &catalog);
        let rule: Rule = serde_json::from_value(json!({
            "id": "corrupt",
            "name": "corrupt",
            "target": {"kind": "category", "id": 20},
            "root": "{not json"
        }))
        .unwrap();

        let preview = matcher.preview(&rule).unwrap();
        assert_eq!(preview.matched_count, 0);
        assert!(matches!(
            preview.warnings.as_slice(),
            [RuleWarning::MalformedTree { .. }]
        ));
    }

    #[test]
    fn test_budget_exceeded() {
        let attributes = attributes();
        let catalog = catalog();
        let matcher =
            RuleMatcher::new(&attributes, &catalog).with_budget(ScanBudget::unlimited().with_max_rows(2));
        let rule = rule(CombineNode::all(vec![
            ConditionNode::new("price", Operator::Gt, 0).into(),
        ]));

        let err = matcher
            .match_ids(&rule, Scope::All, Strategy::PerObject, None)
            .unwrap_err();
        assert_eq!(err.code(), "BUDGET_EXCEEDED");
    }

    #[test]
    fn test_source_comparison_for_product_link() {
        let attributes = attributes();
        let catalog = catalog();
        let matcher = RuleMatcher::new(&attributes, &catalog);
        let root = CombineNode::all(vec![
            ConditionNode::source("color", Operator::MatchesSource).into(),
            ConditionNode::source("category_ids", Operator::NotMatchesSource).into(),
        ]);

        // 参照商品 1：color = Red，分类 {5}
        let linked = Rule::new("related", TargetRef::new(TargetKind::ProductLink, 1), root.clone());
        let outcome = matcher.match_ids(&linked, Scope::All, Strategy::Auto, None).unwrap();
        assert!(outcome.warnings.is_empty());
        assert!(outcome.ids.is_empty());

        // 普通分类目标没有参照商品
        let plain = Rule::new("plain", TargetRef::category(1), root);
        let outcome = matcher.match_ids(&plain, Scope::All, Strategy::Auto, None).unwrap();
        assert!(outcome.ids.is_empty());
        assert_eq!(outcome.warnings.len(), 2);
    }

    #[test]
    fn test_preview_and_explain() {
        let attributes = attributes();
        let catalog = catalog();
        let matcher = RuleMatcher::new(&attributes, &catalog);
        let rule = rule(CombineNode::any(vec![
            ConditionNode::new("color", Operator::Eq, "Blue").into(),
            ConditionNode::new("removed_attr", Operator::Eq, 1).into(),
        ]));

        let preview = matcher.preview(&rule).unwrap();
        assert_eq!(preview.matched_count, 2);
        assert_eq!(preview.warnings.len(), 1);

        let explained = matcher.explain(&rule, 2).unwrap().unwrap();
        assert!(explained.matched);
        assert!(matcher.explain(&rule, 99).unwrap().is_none());
    }
}
