//! 逐对象评估
//!
//! 规则树在评估前预处理为 [`PreparedTree`]：每个叶子只解析一次（包括标签解析和参照商品绑定），
//! 之后对每一行商品做短路求值。[`RuleExecutor`] 在同一棵预处理树上输出评估追踪，
//! 用于解释某个商品为什么匹配或不匹配。

use serde::Serialize;
use std::collections::BTreeSet;

use crate::attribute::{AttributeResolver, ResolvedLeaf, SpecialAttribute};
use crate::models::{CombineNode, ConditionNode, ProductId, RuleNode, RuleWarning};
use crate::operators::Aggregator;
use crate::product::ProductView;
use crate::query::Projection;

/// 聚合子节点结果
///
/// ALL / ANY 均短路求值，之后按 `negate` 取反。没有子节点时恒为 false，与取反标记无关。
pub fn aggregate(aggregator: Aggregator, negate: bool, mut results: impl Iterator<Item = bool>) -> bool {
    let Some(first) = results.next() else {
        return false;
    };
    let combined = match aggregator {
        Aggregator::All => first && results.all(|r| r),
        Aggregator::Any => first || results.any(|r| r),
    };
    combined != negate
}

/// 收集整棵树需要的列和关联，使一次扫描即可满足所有叶子
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequirementCollector {
    pub attributes: BTreeSet<String>,
    pub categories: bool,
    pub stock: bool,
}

impl RequirementCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_projection(self, stock_id: i64) -> Projection {
        Projection {
            attributes: self.attributes,
            categories: self.categories,
            stock_id: self.stock.then_some(stock_id),
        }
    }
}

impl ConditionNode {
    pub fn describe_requirements(&self, collector: &mut RequirementCollector) {
        match SpecialAttribute::from_code(&self.attribute) {
            Some(SpecialAttribute::CategoryIds) => collector.categories = true,
            Some(SpecialAttribute::IsInStock | SpecialAttribute::Qty) => collector.stock = true,
            // 类型与可见性在商品主表上，总是加载
            Some(SpecialAttribute::TypeId | SpecialAttribute::Visibility) => {}
            None => {
                collector.attributes.insert(self.attribute.clone());
            }
        }
    }

    /// 对单个商品评估该条件，无法解析时返回 false
    pub fn validate(
        &self,
        resolver: &AttributeResolver<'_>,
        product: &dyn ProductView,
        source: Option<&dyn ProductView>,
    ) -> bool {
        resolver
            .resolve("root", self)
            .bind_source(source)
            .leaf
            .matches(product)
    }
}

impl CombineNode {
    pub fn describe_requirements(&self, collector: &mut RequirementCollector) {
        for child in &self.conditions {
            match child {
                RuleNode::Condition(cond) => cond.describe_requirements(collector),
                RuleNode::Combine(combine) => combine.describe_requirements(collector),
            }
        }
    }

    /// 对单个商品评估整棵树
    ///
    /// 每次调用都会重新解析叶子；批量评估应使用 [`PreparedTree`]。
    pub fn validate(
        &self,
        resolver: &AttributeResolver<'_>,
        product: &dyn ProductView,
        source: Option<&dyn ProductView>,
    ) -> bool {
        PreparedTree::prepare(self, resolver, source).matches(product)
    }
}

/// 预处理后的节点
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedNode {
    Leaf {
        path: String,
        /// 用于追踪输出，如 `color eq "Red"`
        label: String,
        leaf: ResolvedLeaf,
    },
    Combine {
        path: String,
        aggregator: Aggregator,
        negate: bool,
        children: Vec<PreparedNode>,
    },
}

impl PreparedNode {
    pub fn matches(&self, product: &dyn ProductView) -> bool {
        match self {
            Self::Leaf { leaf, .. } => leaf.matches(product),
            Self::Combine {
                aggregator,
                negate,
                children,
                ..
            } => aggregate(
                *aggregator,
                *negate,
                children.iter().map(|child| child.matches(product)),
            ),
        }
    }
}

/// 预处理后的规则树
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTree {
    root: PreparedNode,
    warnings: Vec<RuleWarning>,
}

impl PreparedTree {
    pub fn prepare(
        tree: &CombineNode,
        resolver: &AttributeResolver<'_>,
        source: Option<&dyn ProductView>,
    ) -> Self {
        let mut warnings = Vec::new();
        let root = Self::prepare_combine(tree, "root", resolver, source, &mut warnings);
        Self { root, warnings }
    }

    fn prepare_combine(
        node: &CombineNode,
        path: &str,
        resolver: &AttributeResolver<'_>,
        source: Option<&dyn ProductView>,
        warnings: &mut Vec<RuleWarning>,
    ) -> PreparedNode {
        let children = node
            .conditions
            .iter()
            .enumerate()
            .map(|(i, child)| {
                let child_path = format!("{}.conditions[{}]", path, i);
                match child {
                    RuleNode::Condition(cond) => {
                        let resolution = resolver.resolve(&child_path, cond).bind_source(source);
                        if let Some(warning) = resolution.warning {
                            warnings.push(warning);
                        }
                        PreparedNode::Leaf {
                            path: child_path,
                            label: format!("{} {} {}", cond.attribute, cond.operator, cond.value),
                            leaf: resolution.leaf,
                        }
                    }
                    RuleNode::Combine(combine) => {
                        Self::prepare_combine(combine, &child_path, resolver, source, warnings)
                    }
                }
            })
            .collect();

        PreparedNode::Combine {
            path: path.to_string(),
            aggregator: node.aggregator,
            negate: node.negate,
            children,
        }
    }

    pub fn matches(&self, product: &dyn ProductView) -> bool {
        self.root.matches(product)
    }

    pub fn root(&self) -> &PreparedNode {
        &self.root
    }

    pub fn warnings(&self) -> &[RuleWarning] {
        &self.warnings
    }
}

/// 单个商品的评估结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub product_id: ProductId,
    pub matched: bool,
    /// 评估为 true 的叶子
    pub matched_conditions: Vec<String>,
    pub evaluation_trace: Vec<String>,
}

/// 规则执行器
pub struct RuleExecutor {
    /// 是否记录详细评估追踪
    trace_enabled: bool,
}

impl RuleExecutor {
    pub fn new() -> Self {
        Self {
            trace_enabled: false,
        }
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// 对单个商品执行评估
    pub fn execute(&self, tree: &PreparedTree, product: &dyn ProductView) -> EvaluationResult {
        let mut result = EvaluationResult {
            product_id: product.id(),
            ..Default::default()
        };
        result.matched = self.evaluate_node(tree.root(), product, &mut result);
        result
    }

    fn evaluate_node(
        &self,
        node: &PreparedNode,
        product: &dyn ProductView,
        result: &mut EvaluationResult,
    ) -> bool {
        match node {
            PreparedNode::Leaf { path, label, leaf } => {
                let matched = leaf.matches(product);
                if self.trace_enabled {
                    let verdict = match leaf {
                        ResolvedLeaf::Unresolvable => "UNRESOLVABLE",
                        ResolvedLeaf::Never => "NEVER",
                        _ if matched => "MATCHED",
                        _ => "NOT_MATCHED",
                    };
                    result
                        .evaluation_trace
                        .push(format!("{}: {} => {}", path, label, verdict));
                }
                if matched {
                    result.matched_conditions.push(format!("{}: {}", path, label));
                }
                matched
            }
            PreparedNode::Combine {
                path,
                aggregator,
                negate,
                children,
            } => self.evaluate_combine(path, *aggregator, *negate, children, product, result),
        }
    }

    /// 评估组合节点（短路求值）
    fn evaluate_combine(
        &self,
        path: &str,
        aggregator: Aggregator,
        negate: bool,
        children: &[PreparedNode],
        product: &dyn ProductView,
        result: &mut EvaluationResult,
    ) -> bool {
        if self.trace_enabled {
            result.evaluation_trace.push(format!(
                "{}: 开始评估 {}{} 组 (共 {} 个子节点)",
                path,
                if negate { "NOT " } else { "" },
                aggregator,
                children.len()
            ));
        }

        if children.is_empty() {
            if self.trace_enabled {
                result
                    .evaluation_trace
                    .push(format!("{}: 空组不匹配任何商品", path));
            }
            return false;
        }

        let short_circuit_on = aggregator == Aggregator::Any;
        let mut combined = !short_circuit_on;
        for (i, child) in children.iter().enumerate() {
            if self.evaluate_node(child, product, result) == short_circuit_on {
                if self.trace_enabled {
                    result.evaluation_trace.push(format!(
                        "{}: {} 短路 - 子节点 {} {}",
                        path,
                        aggregator,
                        i,
                        if short_circuit_on { "匹配" } else { "不匹配" }
                    ));
                }
                combined = short_circuit_on;
                break;
            }
        }

        combined != negate
    }
}

impl Default for RuleExecutor {
    fn default() -> Self {
        Self::new()
    }
}
