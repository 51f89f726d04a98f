//! 谓词下推编译
//!
//! 将一层结构的规则（若干组，组内 OR、组间 AND）编译为 [`QueryBuilder`] 上的过滤和关联，
//! 批量筛选时不需要逐行物化候选商品。更深的嵌套由 [`FlatRule::from_tree`] 拒绝，
//! 调用方回退到逐对象评估。

use serde_json::Value;

use crate::attribute::{AttributeResolver, ResolvedLeaf};
use crate::evaluator::FilterSpec;
use crate::models::{CombineNode, ConditionNode, RuleNode, RuleWarning};
use crate::operators::Aggregator;
use crate::product::ProductView;
use crate::query::{ColumnRef, JoinSpec, Predicate, QueryBuilder};

/// 带路径的条件（路径用于警告定位）
#[derive(Debug, Clone, PartialEq)]
pub struct FlatCondition {
    pub path: String,
    pub condition: ConditionNode,
}

/// 一层结构的规则：组内条件为 OR，组之间为 AND
///
/// 空组恒为 false。
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRule {
    pub groups: Vec<Vec<FlatCondition>>,
}

impl FlatRule {
    /// 判断规则树能否展开为一层结构
    ///
    /// 可展开的形状：
    /// - 根节点为空（恒为 false）；
    /// - 根节点为 ALL，子节点为条件、只含条件的 ANY 组或只含条件的 ALL 组；
    /// - 根节点为 ANY，子节点全部为条件。
    ///
    /// 任何取反的组合节点都不展开。
    pub fn from_tree(tree: &CombineNode) -> Option<Self> {
        if tree.is_empty() {
            return Some(Self {
                groups: vec![Vec::new()],
            });
        }
        if tree.negate {
            return None;
        }

        match tree.aggregator {
            Aggregator::Any => {
                let group = tree
                    .conditions
                    .iter()
                    .enumerate()
                    .map(|(i, child)| match child {
                        RuleNode::Condition(cond) => Some(flat("root", i, cond)),
                        RuleNode::Combine(_) => None,
                    })
                    .collect::<Option<Vec<_>>>()?;
                Some(Self {
                    groups: vec![group],
                })
            }
            Aggregator::All => {
                let mut groups = Vec::new();
                for (i, child) in tree.conditions.iter().enumerate() {
                    match child {
                        RuleNode::Condition(cond) => groups.push(vec![flat("root", i, cond)]),
                        RuleNode::Combine(nested) => {
                            if nested.negate {
                                return None;
                            }
                            let parent = format!("root.conditions[{}]", i);
                            let members = nested
                                .conditions
                                .iter()
                                .enumerate()
                                .map(|(j, grandchild)| match grandchild {
                                    RuleNode::Condition(cond) => Some(flat(&parent, j, cond)),
                                    RuleNode::Combine(_) => None,
                                })
                                .collect::<Option<Vec<_>>>()?;

                            match nested.aggregator {
                                _ if members.is_empty() => groups.push(Vec::new()),
                                Aggregator::Any => groups.push(members),
                                Aggregator::All => {
                                    groups.extend(members.into_iter().map(|m| vec![m]))
                                }
                            }
                        }
                    }
                }
                Some(Self { groups })
            }
        }
    }

    pub fn condition_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }
}

fn flat(parent: &str, index: usize, cond: &ConditionNode) -> FlatCondition {
    FlatCondition {
        path: format!("{}.conditions[{}]", parent, index),
        condition: cond.clone(),
    }
}

/// 编译报告
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileReport {
    pub warnings: Vec<RuleWarning>,
    /// 下推到查询的条件数
    pub pushed_down: usize,
    /// 因无法解析而跳过的条件数
    pub skipped: usize,
}

/// 谓词编译器
pub struct PredicateCompiler<'a> {
    resolver: &'a AttributeResolver<'a>,
    stock_id: i64,
}

impl<'a> PredicateCompiler<'a> {
    pub fn new(resolver: &'a AttributeResolver<'a>, stock_id: i64) -> Self {
        Self { resolver, stock_id }
    }

    /// 就地修改查询，使其只返回满足规则的商品
    ///
    /// 无法解析的条件被跳过；组内所有条件都被跳过时整组恒为 false，
    /// 与逐对象评估中无法解析的叶子恒为 false 保持一致。
    pub fn apply(
        &self,
        rule: &FlatRule,
        source: Option<&dyn ProductView>,
        query: &mut QueryBuilder,
    ) -> CompileReport {
        let mut report = CompileReport::default();

        for (group_index, group) in rule.groups.iter().enumerate() {
            let mut leaves = Vec::with_capacity(group.len());
            for member in group {
                let resolution = self
                    .resolver
                    .resolve(&member.path, &member.condition)
                    .bind_source(source);
                if let Some(warning) = resolution.warning {
                    report.warnings.push(warning);
                }
                if resolution.leaf.is_never() {
                    report.skipped += 1;
                } else {
                    leaves.push(resolution.leaf);
                }
            }

            report.pushed_down += leaves.len();
            match leaves.len() {
                0 => {
                    query.add_where(Predicate::False);
                }
                1 => self.compile_single(group_index, leaves.remove(0), query),
                _ => self.compile_group(leaves, query),
            }
        }

        report
    }

    /// 组内只有一个条件
    fn compile_single(&self, group_index: usize, leaf: ResolvedLeaf, query: &mut QueryBuilder) {
        match leaf {
            ResolvedLeaf::Category { include: true, ids } => {
                // 每组独立别名，否则两个分类条件会约束同一条关联记录
                let alias = format!("cat_{}", group_index);
                query
                    .join_field(JoinSpec::category(alias.clone()))
                    .add_where(Predicate::Filter {
                        column: ColumnRef::joined(alias, "category_id"),
                        spec: FilterSpec::In(ids.into_iter().map(Value::from).collect()),
                    })
                    .distinct();
            }
            ResolvedLeaf::Attribute { code, spec } => {
                query.add_attribute_filter(code, spec);
            }
            other => {
                if let Some(predicate) = self.to_predicate(other, query) {
                    query.add_where(predicate);
                }
            }
        }
    }

    /// 组内多个条件（OR）
    fn compile_group(&self, leaves: Vec<ResolvedLeaf>, query: &mut QueryBuilder) {
        let all_plain = leaves
            .iter()
            .all(|leaf| matches!(leaf, ResolvedLeaf::Attribute { .. }));

        if all_plain {
            let filters = leaves
                .into_iter()
                .filter_map(|leaf| match leaf {
                    ResolvedLeaf::Attribute { code, spec } => Some((code, spec)),
                    _ => None,
                })
                .collect();
            query.add_attribute_filter_any(filters);
            return;
        }

        let predicates = leaves
            .into_iter()
            .filter_map(|leaf| self.to_predicate(leaf, query))
            .collect();
        query.add_where(Predicate::Any(predicates));
    }

    /// 单个叶子对应的谓词，需要的关联会同时加到查询上
    fn to_predicate(&self, leaf: ResolvedLeaf, query: &mut QueryBuilder) -> Option<Predicate> {
        match leaf {
            ResolvedLeaf::Attribute { code, spec } => Some(Predicate::attribute(code, spec)),
            ResolvedLeaf::Field { field, spec } => Some(Predicate::Filter {
                column: ColumnRef::Entity(field),
                spec,
            }),
            ResolvedLeaf::Stock { field, spec } => {
                let join = JoinSpec::stock(self.stock_id);
                let alias = join.alias.clone();
                query.join_field(join);
                Some(Predicate::Filter {
                    column: ColumnRef::joined(alias, field.column()),
                    spec,
                })
            }
            // 多对多关联，排除必须用子查询而不是关联
            ResolvedLeaf::Category { include, ids } => {
                Some(Predicate::category_membership(include, ids))
            }
            ResolvedLeaf::SourceComparison { .. } | ResolvedLeaf::Never | ResolvedLeaf::Unresolvable => {
                None
            }
        }
    }
}
