//! 规则引擎领域模型

use crate::operators::{Aggregator, Operator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// 商品 ID
pub type ProductId = i64;

/// 单次评估得到的商品 ID 集合，不做持久化
pub type MatchResult = BTreeSet<ProductId>;

/// 规则作用的目标类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// 智能分类
    Category,
    /// 导出 Feed
    Feed,
    /// 关联商品规则，目标 ID 即参照商品 ID
    ProductLink,
    /// 支付限制
    PaymentRestriction,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Feed => "feed",
            Self::ProductLink => "product_link",
            Self::PaymentRestriction => "payment_restriction",
        }
    }
}

/// 规则目标引用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: TargetKind,
    pub id: i64,
}

impl TargetRef {
    pub fn new(kind: TargetKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn category(id: i64) -> Self {
        Self::new(TargetKind::Category, id)
    }

    /// 关联商品目标，`product_id` 同时是参照商品
    pub fn product_link(product_id: ProductId) -> Self {
        Self::new(TargetKind::ProductLink, product_id)
    }

    /// 关联商品规则以目标商品作为参照商品
    pub fn source_product(&self) -> Option<ProductId> {
        match self.kind {
            TargetKind::ProductLink => Some(self.id),
            _ => None,
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// 规则定义
///
/// 由外部应用持有，引擎只在评估期间借用。
///
/// 反序列化经过 [`StoredRule`](crate::serializer::StoredRule)：持久化的规则树损坏时按空树处理
/// （不匹配任何商品），警告保存在 `load_warnings` 中，随评估结果一起返回。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "crate::serializer::StoredRule")]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub target: TargetRef,
    pub root: CombineNode,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 加载时产生的警告，不写回持久化格式
    #[serde(skip)]
    pub load_warnings: Vec<RuleWarning>,
}

impl Rule {
    pub fn new(name: impl Into<String>, target: TargetRef, root: CombineNode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            target,
            root,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            load_warnings: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// 规则树节点（条件或组合）
///
/// 持久化格式中没有类型标签，条件节点以 `attribute` 字段区分。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RuleNode {
    Condition(ConditionNode),
    Combine(CombineNode),
}

impl From<ConditionNode> for RuleNode {
    fn from(node: ConditionNode) -> Self {
        Self::Condition(node)
    }
}

impl From<CombineNode> for RuleNode {
    fn from(node: CombineNode) -> Self {
        Self::Combine(node)
    }
}

/// 条件节点：属性 + 操作符 + 值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionNode {
    pub attribute: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    /// 多选属性的 eq/neq 按集合完全相等比较，否则按任一匹配
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub explicit_apply: bool,
}

impl ConditionNode {
    pub fn new(attribute: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            operator,
            value: value.into(),
            explicit_apply: false,
        }
    }

    /// 与参照商品比较的条件，不带值
    pub fn source(attribute: impl Into<String>, operator: Operator) -> Self {
        Self::new(attribute, operator, Value::Null)
    }

    pub fn explicit(mut self) -> Self {
        self.explicit_apply = true;
        self
    }
}

/// 组合节点：有序子节点 + 聚合方式 + 取反标记
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombineNode {
    pub aggregator: Aggregator,
    pub negate: bool,
    pub conditions: Vec<RuleNode>,
}

impl CombineNode {
    pub fn new(aggregator: Aggregator, conditions: Vec<RuleNode>) -> Self {
        Self {
            aggregator,
            negate: false,
            conditions,
        }
    }

    pub fn all(conditions: Vec<RuleNode>) -> Self {
        Self::new(Aggregator::All, conditions)
    }

    pub fn any(conditions: Vec<RuleNode>) -> Self {
        Self::new(Aggregator::Any, conditions)
    }

    /// 没有任何子节点的树，不匹配任何商品
    pub fn empty() -> Self {
        Self::all(Vec::new())
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// 树的深度（只有根节点时为 1）
    pub fn depth(&self) -> usize {
        1 + self
            .conditions
            .iter()
            .map(|child| match child {
                RuleNode::Condition(_) => 0,
                RuleNode::Combine(c) => c.depth(),
            })
            .max()
            .unwrap_or(0)
    }

    /// 深度优先遍历所有条件节点，回调参数为节点路径（如 `root.conditions[1].conditions[0]`）
    pub fn for_each_condition<F>(&self, mut f: F)
    where
        F: FnMut(&str, &ConditionNode),
    {
        self.visit_conditions("root", &mut f);
    }

    fn visit_conditions<F>(&self, path: &str, f: &mut F)
    where
        F: FnMut(&str, &ConditionNode),
    {
        for (i, child) in self.conditions.iter().enumerate() {
            let child_path = format!("{}.conditions[{}]", path, i);
            match child {
                RuleNode::Condition(cond) => f(&child_path, cond),
                RuleNode::Combine(combine) => combine.visit_conditions(&child_path, f),
            }
        }
    }

    /// 条件节点总数
    pub fn condition_count(&self) -> usize {
        let mut count = 0;
        self.for_each_condition(|_, _| count += 1);
        count
    }
}

/// 持久化文档：核心语法树 + 仅供界面使用的附加信息
///
/// `ui` 中的内容不参与评估，只原样往返。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleDocument {
    pub tree: CombineNode,
    pub ui: Option<Map<String, Value>>,
}

impl Default for CombineNode {
    fn default() -> Self {
        Self::empty()
    }
}

/// 评估过程中产生的非致命警告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum RuleWarning {
    /// 属性已被删除或从未存在
    UnresolvableAttribute { path: String, attribute: String },
    /// 文本值没有匹配到任何选项
    UnknownOption {
        path: String,
        attribute: String,
        value: String,
    },
    /// 操作符不适用于该属性类型
    OperatorNotAllowed {
        path: String,
        attribute: String,
        operator: String,
        kind: String,
    },
    /// 与参照商品比较但上下文中没有参照商品
    MissingSource { path: String, attribute: String },
    /// 持久化的规则树无法解析
    MalformedTree { message: String },
}

impl RuleWarning {
    pub fn attribute(&self) -> Option<&str> {
        match self {
            Self::UnresolvableAttribute { attribute, .. }
            | Self::UnknownOption { attribute, .. }
            | Self::OperatorNotAllowed { attribute, .. }
            | Self::MissingSource { attribute, .. } => Some(attribute),
            Self::MalformedTree { .. } => None,
        }
    }
}

impl fmt::Display for RuleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvableAttribute { path, attribute } => {
                write!(f, "{}: 属性 '{}' 无法解析", path, attribute)
            }
            Self::UnknownOption {
                path,
                attribute,
                value,
            } => write!(f, "{}: 属性 '{}' 没有与 '{}' 匹配的选项", path, attribute, value),
            Self::OperatorNotAllowed {
                path,
                attribute,
                operator,
                kind,
            } => write!(
                f,
                "{}: 操作符 {} 不适用于属性 '{}' ({})",
                path, operator, attribute, kind
            ),
            Self::MissingSource { path, attribute } => {
                write!(f, "{}: 属性 '{}' 需要参照商品", path, attribute)
            }
            Self::MalformedTree { message } => write!(f, "规则树格式错误: {}", message),
        }
    }
}

/// 成员差异：需要新增和移除的商品
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationDiff {
    pub to_add: BTreeSet<ProductId>,
    pub to_remove: BTreeSet<ProductId>,
}

impl ReconciliationDiff {
    /// 对比实时匹配结果与当前成员
    pub fn compute(effective: &MatchResult, current: &BTreeSet<ProductId>) -> Self {
        Self {
            to_add: effective.difference(current).copied().collect(),
            to_remove: current.difference(effective).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// 将差异应用到一个成员集合上
    pub fn apply_to(&self, members: &mut BTreeSet<ProductId>) {
        for id in &self.to_remove {
            members.remove(id);
        }
        members.extend(self.to_add.iter().copied());
    }
}
