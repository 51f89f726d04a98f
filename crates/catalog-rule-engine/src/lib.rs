//! 商品规则引擎
//!
//! 以声明式条件树描述一组商品，支持：
//! - 条件树的 JSON 序列化与宽松加载
//! - 逐对象评估（带短路和评估追踪）
//! - 谓词下推到目录查询
//! - 目标成员的全量与增量同步

pub mod attribute;
pub mod catalog;
pub mod compiler;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod matcher;
pub mod models;
pub mod operators;
pub mod product;
pub mod query;
pub mod reconcile;
pub mod serializer;
pub mod session;
pub mod store;

pub use attribute::{
    AttributeMeta, AttributeMetadata, AttributeResolver, InMemoryAttributeCatalog, InputType,
};
pub use catalog::{CatalogSnapshot, CatalogSource, MemoryCatalog};
pub use compiler::{FlatRule, PredicateCompiler};
pub use error::{Result, RuleError};
pub use evaluator::FilterSpec;
pub use executor::{EvaluationResult, PreparedTree, RuleExecutor};
pub use matcher::{RuleMatcher, RulePreview, ScanBudget, Scope, Strategy};
pub use models::{
    CombineNode, ConditionNode, MatchResult, ProductId, ReconciliationDiff, Rule, RuleDocument,
    RuleNode, RuleWarning, TargetKind, TargetRef,
};
pub use operators::{Aggregator, Operator};
pub use product::{ProductRow, ProductView};
pub use query::QueryBuilder;
pub use reconcile::{
    MembershipStore, MemoryMembershipStore, ReconcileSettings, ReconcileSummary,
    ReconciliationEngine, TargetReport,
};
pub use serializer::RuleSerializer;
pub use session::{EvaluationSession, SessionEntry};
pub use store::{RuleProvider, RuleStore};
