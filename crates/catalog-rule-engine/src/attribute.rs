//! 属性解析
//!
//! 将条件节点的属性代码归类（普通属性 / 特殊伪属性 / 参照商品比较），
//! 并把选项类属性上的文本值解析为选项 ID。
//!
//! [`AttributeResolver::resolve`] 是逐对象评估与谓词下推的唯一入口，
//! 两条路径拿到的是同一个 [`ResolvedLeaf`]，因此对同一棵树和同一份数据结果一致。

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

use crate::evaluator::{self, FilterSpec, LikePattern};
use crate::models::{CombineNode, ConditionNode, RuleWarning};
use crate::operators::Operator;
use crate::product::{EntityField, ProductView, StockField};

/// 不可能存在的选项 ID，用于“没有任何选项匹配”时构造必然为空的 IN 条件
pub const IMPOSSIBLE_OPTION_ID: i64 = -1;

/// 属性输入类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Text,
    Numeric,
    Date,
    Boolean,
    Select,
    Multiselect,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Numeric => "numeric",
            Self::Date => "date",
            Self::Boolean => "boolean",
            Self::Select => "select",
            Self::Multiselect => "multiselect",
        }
    }

    /// 是否以选项 ID 存储（界面上显示为标签）
    pub fn is_option_backed(&self) -> bool {
        matches!(self, Self::Select | Self::Multiselect)
    }
}

/// 属性选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeOption {
    pub id: i64,
    pub label: String,
}

/// 属性元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMeta {
    pub code: String,
    pub input: InputType,
    #[serde(default)]
    pub options: Vec<AttributeOption>,
    /// 是否可用于参照商品比较
    #[serde(default = "default_true")]
    pub usable_for_source: bool,
}

fn default_true() -> bool {
    true
}

impl AttributeMeta {
    pub fn new(code: impl Into<String>, input: InputType) -> Self {
        Self {
            code: code.into(),
            input,
            options: Vec::new(),
            usable_for_source: true,
        }
    }

    pub fn text(code: impl Into<String>) -> Self {
        Self::new(code, InputType::Text)
    }

    pub fn numeric(code: impl Into<String>) -> Self {
        Self::new(code, InputType::Numeric)
    }

    pub fn date(code: impl Into<String>) -> Self {
        Self::new(code, InputType::Date)
    }

    pub fn boolean(code: impl Into<String>) -> Self {
        Self::new(code, InputType::Boolean)
    }

    pub fn select(code: impl Into<String>, options: &[(i64, &str)]) -> Self {
        Self::new(code, InputType::Select).with_options(options)
    }

    pub fn multiselect(code: impl Into<String>, options: &[(i64, &str)]) -> Self {
        Self::new(code, InputType::Multiselect).with_options(options)
    }

    pub fn with_options(mut self, options: &[(i64, &str)]) -> Self {
        self.options = options
            .iter()
            .map(|(id, label)| AttributeOption {
                id: *id,
                label: label.to_string(),
            })
            .collect();
        self
    }

    pub fn not_usable_for_source(mut self) -> Self {
        self.usable_for_source = false;
        self
    }
}

/// 属性元数据服务
#[cfg_attr(test, mockall::automock)]
pub trait AttributeMetadata: Send + Sync {
    /// 按代码查询属性，已删除或不存在时返回 None
    fn attribute(&self, code: &str) -> Option<AttributeMeta>;
}

/// 内存属性目录
#[derive(Debug, Default)]
pub struct InMemoryAttributeCatalog {
    attributes: DashMap<String, AttributeMeta>,
}

impl InMemoryAttributeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_attributes(attributes: impl IntoIterator<Item = AttributeMeta>) -> Self {
        let catalog = Self::new();
        for meta in attributes {
            catalog.insert(meta);
        }
        catalog
    }

    pub fn insert(&self, meta: AttributeMeta) {
        self.attributes.insert(meta.code.clone(), meta);
    }

    pub fn remove(&self, code: &str) -> Option<AttributeMeta> {
        self.attributes.remove(code).map(|(_, meta)| meta)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl AttributeMetadata for InMemoryAttributeCatalog {
    fn attribute(&self, code: &str) -> Option<AttributeMeta> {
        self.attributes.get(code).map(|meta| meta.clone())
    }
}

/// 特殊伪属性：不在商品自身记录上，需要关联或旁路查询
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialAttribute {
    CategoryIds,
    TypeId,
    Visibility,
    IsInStock,
    Qty,
}

impl SpecialAttribute {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "category_ids" => Some(Self::CategoryIds),
            "type_id" => Some(Self::TypeId),
            "visibility" => Some(Self::Visibility),
            "is_in_stock" | "quantity_and_stock_status" => Some(Self::IsInStock),
            "qty" => Some(Self::Qty),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::CategoryIds => "category_ids",
            Self::TypeId => "type_id",
            Self::Visibility => "visibility",
            Self::IsInStock => "is_in_stock",
            Self::Qty => "qty",
        }
    }
}

/// 叶子节点的属性类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Attribute(InputType),
    Special(SpecialAttribute),
}

impl LeafKind {
    /// 该类别接受的操作符（参照商品比较另行判断）
    pub fn allowed_operators(&self) -> &'static [Operator] {
        use Operator::*;
        match self {
            Self::Attribute(InputType::Text) => &[
                Eq, Neq, Gt, Gteq, Lt, Lteq, Like, Nlike, In, Nin, Null, Notnull,
            ],
            Self::Attribute(InputType::Numeric | InputType::Date) => {
                &[Eq, Neq, Gt, Gteq, Lt, Lteq, In, Nin, Null, Notnull]
            }
            Self::Attribute(InputType::Boolean) => &[Eq, Neq, Null, Notnull],
            Self::Attribute(InputType::Select | InputType::Multiselect) => {
                &[Eq, Neq, Like, Nlike, In, Nin, Null, Notnull]
            }
            Self::Special(SpecialAttribute::CategoryIds)
            | Self::Special(SpecialAttribute::TypeId)
            | Self::Special(SpecialAttribute::Visibility) => &[Eq, Neq, In, Nin],
            Self::Special(SpecialAttribute::IsInStock) => &[Eq, Neq],
            Self::Special(SpecialAttribute::Qty) => &[Eq, Neq, Gt, Gteq, Lt, Lteq],
        }
    }

    /// 是否可以与参照商品比较
    pub fn supports_source(&self) -> bool {
        !matches!(
            self,
            Self::Special(SpecialAttribute::IsInStock | SpecialAttribute::Qty)
        )
    }
}

impl fmt::Display for LeafKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attribute(input) => write!(f, "attribute/{}", input.as_str()),
            Self::Special(special) => write!(f, "special/{}", special.code()),
        }
    }
}

/// 参照商品比较的对象
#[derive(Debug, Clone, PartialEq)]
pub enum SourceAttribute {
    Attribute { code: String, input: InputType },
    Field(EntityField),
    Category,
}

/// 解析后的叶子节点
///
/// 封闭的变体集合，逐对象评估（[`ResolvedLeaf::matches`]）与谓词下推
/// （[`crate::compiler::PredicateCompiler`]）都以它为输入。
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedLeaf {
    /// 普通 EAV 属性上的过滤
    Attribute { code: String, spec: FilterSpec },
    /// 商品实体表字段（类型、可见性）
    Field { field: EntityField, spec: FilterSpec },
    /// 库存表字段
    Stock { field: StockField, spec: FilterSpec },
    /// 分类成员：include 为 true 时要求与 ids 有交集，否则要求无交集
    Category { include: bool, ids: BTreeSet<i64> },
    /// 与参照商品比较，评估前需调用 [`Resolution::bind_source`]
    SourceComparison {
        attribute: SourceAttribute,
        negate: bool,
    },
    /// 恒为 false（如参照商品上该属性为空）
    Never,
    /// 无法解析，恒为 false
    Unresolvable,
}

impl ResolvedLeaf {
    /// 逐对象评估
    pub fn matches(&self, product: &dyn ProductView) -> bool {
        match self {
            Self::Attribute { code, spec } => spec.matches(product.attribute(code)),
            Self::Field { field, spec } => spec.matches(product.field(*field).as_ref()),
            Self::Stock { field, spec } => spec.matches(product.stock_value(*field).as_ref()),
            Self::Category { include, ids } => {
                let intersects = !product.category_ids().is_disjoint(ids);
                intersects == *include
            }
            Self::SourceComparison { .. } | Self::Never | Self::Unresolvable => false,
        }
    }

    /// 是否恒为 false
    pub fn is_never(&self) -> bool {
        matches!(
            self,
            Self::Never | Self::Unresolvable | Self::SourceComparison { .. }
        )
    }
}

/// 单个条件的解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub path: String,
    pub attribute: String,
    pub leaf: ResolvedLeaf,
    pub warning: Option<RuleWarning>,
}

impl Resolution {
    fn new(path: &str, cond: &ConditionNode, leaf: ResolvedLeaf) -> Self {
        Self {
            path: path.to_string(),
            attribute: cond.attribute.clone(),
            leaf,
            warning: None,
        }
    }

    fn unresolvable(path: &str, cond: &ConditionNode, warning: RuleWarning) -> Self {
        Self {
            warning: Some(warning),
            ..Self::new(path, cond, ResolvedLeaf::Unresolvable)
        }
    }

    /// 用参照商品的值替换参照比较，得到普通的叶子节点
    ///
    /// 没有参照商品时叶子恒为 false 并附带 `MissingSource` 警告。
    pub fn bind_source(mut self, source: Option<&dyn ProductView>) -> Self {
        let ResolvedLeaf::SourceComparison { attribute, negate } = &self.leaf else {
            return self;
        };

        let Some(source) = source else {
            self.warning = Some(RuleWarning::MissingSource {
                path: self.path.clone(),
                attribute: self.attribute.clone(),
            });
            self.leaf = ResolvedLeaf::Never;
            return self;
        };

        let negate = *negate;
        self.leaf = match attribute {
            SourceAttribute::Category => ResolvedLeaf::Category {
                include: !negate,
                ids: source.category_ids().clone(),
            },
            SourceAttribute::Field(field) => match source.field(*field) {
                Some(value) => ResolvedLeaf::Field {
                    field: *field,
                    spec: if negate {
                        FilterSpec::Neq(value)
                    } else {
                        FilterSpec::Eq(value)
                    },
                },
                None => ResolvedLeaf::Never,
            },
            SourceAttribute::Attribute { code, input } => {
                match source.attribute(code).filter(|v| !v.is_null()) {
                    None => ResolvedLeaf::Never,
                    Some(value) => {
                        let spec = match input {
                            InputType::Multiselect => {
                                let ids = evaluator::option_ids(value).unwrap_or_default();
                                if negate {
                                    FilterSpec::NoneOf(ids)
                                } else {
                                    FilterSpec::AnyOf(ids)
                                }
                            }
                            _ if negate => FilterSpec::Neq(value.clone()),
                            _ => FilterSpec::Eq(value.clone()),
                        };
                        ResolvedLeaf::Attribute {
                            code: code.clone(),
                            spec,
                        }
                    }
                }
            }
        };
        self
    }
}

/// 属性解析器
pub struct AttributeResolver<'a> {
    metadata: &'a dyn AttributeMetadata,
}

impl<'a> AttributeResolver<'a> {
    pub fn new(metadata: &'a dyn AttributeMetadata) -> Self {
        Self { metadata }
    }

    /// 归类属性代码，未知属性返回 None
    pub fn classify(&self, code: &str) -> Option<(LeafKind, Option<AttributeMeta>)> {
        if let Some(special) = SpecialAttribute::from_code(code) {
            return Some((LeafKind::Special(special), None));
        }
        self.metadata
            .attribute(code)
            .map(|meta| (LeafKind::Attribute(meta.input), Some(meta)))
    }

    /// 解析单个条件节点
    ///
    /// 从不返回错误：属性不存在、操作符不适用等情况都得到恒为 false 的叶子并附带警告。
    pub fn resolve(&self, path: &str, cond: &ConditionNode) -> Resolution {
        let Some((kind, meta)) = self.classify(&cond.attribute) else {
            return Resolution::unresolvable(
                path,
                cond,
                RuleWarning::UnresolvableAttribute {
                    path: path.to_string(),
                    attribute: cond.attribute.clone(),
                },
            );
        };

        let allowed = if cond.operator.is_source_comparison() {
            kind.supports_source() && meta.as_ref().map_or(true, |m| m.usable_for_source)
        } else {
            kind.allowed_operators().contains(&cond.operator)
        };

        if !allowed {
            return Resolution::unresolvable(
                path,
                cond,
                RuleWarning::OperatorNotAllowed {
                    path: path.to_string(),
                    attribute: cond.attribute.clone(),
                    operator: cond.operator.to_string(),
                    kind: kind.to_string(),
                },
            );
        }

        if cond.operator.is_source_comparison() {
            let attribute = match (kind, meta) {
                (LeafKind::Special(SpecialAttribute::CategoryIds), _) => SourceAttribute::Category,
                (LeafKind::Special(SpecialAttribute::TypeId), _) => {
                    SourceAttribute::Field(EntityField::TypeId)
                }
                (LeafKind::Special(_), _) => SourceAttribute::Field(EntityField::Visibility),
                (LeafKind::Attribute(input), _) => SourceAttribute::Attribute {
                    code: cond.attribute.clone(),
                    input,
                },
            };
            let leaf = ResolvedLeaf::SourceComparison {
                attribute,
                negate: cond.operator == Operator::NotMatchesSource,
            };
            return Resolution::new(path, cond, leaf);
        }

        match (kind, meta) {
            (LeafKind::Special(special), _) => {
                Resolution::new(path, cond, Self::resolve_special(special, cond))
            }
            (LeafKind::Attribute(input), Some(meta)) if input.is_option_backed() => {
                self.resolve_option_attribute(path, cond, &meta)
            }
            (LeafKind::Attribute(_), _) => {
                let leaf = match plain_spec(cond.operator, &cond.value) {
                    Some(spec) => ResolvedLeaf::Attribute {
                        code: cond.attribute.clone(),
                        spec,
                    },
                    None => ResolvedLeaf::Unresolvable,
                };
                Resolution::new(path, cond, leaf)
            }
        }
    }

    /// 解析特殊伪属性
    fn resolve_special(special: SpecialAttribute, cond: &ConditionNode) -> ResolvedLeaf {
        let include = !cond.operator.is_negative();
        match special {
            SpecialAttribute::CategoryIds => ResolvedLeaf::Category {
                include,
                ids: evaluator::id_set(&cond.value),
            },
            SpecialAttribute::TypeId => {
                let types = evaluator::value_list(&cond.value);
                ResolvedLeaf::Field {
                    field: EntityField::TypeId,
                    spec: if include {
                        FilterSpec::In(types)
                    } else {
                        FilterSpec::Nin(types)
                    },
                }
            }
            SpecialAttribute::Visibility => {
                // 可见性允许以 "2,4" 这样的分隔字符串给出
                let values: Vec<Value> = evaluator::id_set(&cond.value)
                    .into_iter()
                    .map(Value::from)
                    .collect();
                ResolvedLeaf::Field {
                    field: EntityField::Visibility,
                    spec: if include {
                        FilterSpec::In(values)
                    } else {
                        FilterSpec::Nin(values)
                    },
                }
            }
            SpecialAttribute::IsInStock => ResolvedLeaf::Stock {
                field: StockField::IsInStock,
                spec: if include {
                    FilterSpec::Eq(cond.value.clone())
                } else {
                    FilterSpec::Neq(cond.value.clone())
                },
            },
            SpecialAttribute::Qty => match plain_spec(cond.operator, &cond.value) {
                Some(spec) => ResolvedLeaf::Stock {
                    field: StockField::Qty,
                    spec,
                },
                None => ResolvedLeaf::Unresolvable,
            },
        }
    }

    /// 解析选项类属性（单选 / 多选）
    fn resolve_option_attribute(
        &self,
        path: &str,
        cond: &ConditionNode,
        meta: &AttributeMeta,
    ) -> Resolution {
        let needs_labels = matches!(cond.operator, Operator::Like | Operator::Nlike)
            || (matches!(
                cond.operator,
                Operator::Eq | Operator::Neq | Operator::In | Operator::Nin
            ) && is_textual(&cond.value));

        if needs_labels {
            return self.resolve_labels(path, cond, meta);
        }

        let multiselect = meta.input == InputType::Multiselect;
        let spec = match cond.operator {
            Operator::Null => FilterSpec::Null,
            Operator::Notnull => FilterSpec::NotNull,
            op if multiselect => {
                let ids = evaluator::id_set(&cond.value);
                match op {
                    Operator::Eq if cond.explicit_apply => FilterSpec::SetEq(ids),
                    Operator::Neq if cond.explicit_apply => FilterSpec::SetNeq(ids),
                    Operator::Eq | Operator::In => FilterSpec::AnyOf(ids),
                    _ => FilterSpec::NoneOf(ids),
                }
            }
            op => match plain_spec(op, &cond.value) {
                Some(spec) => spec,
                None => return Resolution::new(path, cond, ResolvedLeaf::Unresolvable),
            },
        };

        Resolution::new(
            path,
            cond,
            ResolvedLeaf::Attribute {
                code: cond.attribute.clone(),
                spec,
            },
        )
    }

    /// 将文本值解析为选项 ID
    ///
    /// 按原始操作符匹配选项标签：eq/neq/in/nin 为大小写不敏感的完全相等，
    /// like/nlike 为大小写不敏感的子串匹配。肯定类操作符改写为 IN，
    /// 没有匹配时改写为 `IN [IMPOSSIBLE_OPTION_ID]`；否定类改写为 NOT IN。
    fn resolve_labels(&self, path: &str, cond: &ConditionNode, meta: &AttributeMeta) -> Resolution {
        let needles: Vec<String> = evaluator::value_list(&cond.value)
            .iter()
            .map(evaluator::as_text)
            .collect();
        let substring = matches!(cond.operator, Operator::Like | Operator::Nlike);
        let patterns: Vec<LikePattern> = if substring {
            needles.iter().map(|n| LikePattern::new(n)).collect()
        } else {
            Vec::new()
        };

        let matched: BTreeSet<i64> = meta
            .options
            .iter()
            .filter(|option| {
                if substring {
                    patterns.iter().any(|p| p.is_match(&option.label))
                } else {
                    let label = option.label.to_lowercase();
                    needles.iter().any(|n| n.to_lowercase() == label)
                }
            })
            .map(|option| option.id)
            .collect();

        let mut resolution_warning = None;
        let positive = !cond.operator.is_negative();
        let ids = if matched.is_empty() {
            resolution_warning = Some(RuleWarning::UnknownOption {
                path: path.to_string(),
                attribute: cond.attribute.clone(),
                value: needles.join(","),
            });
            if positive {
                BTreeSet::from([IMPOSSIBLE_OPTION_ID])
            } else {
                BTreeSet::new()
            }
        } else {
            matched
        };

        let spec = match (meta.input, positive) {
            (InputType::Multiselect, true) if cond.explicit_apply && cond.operator == Operator::Eq => {
                FilterSpec::SetEq(ids)
            }
            (InputType::Multiselect, false)
                if cond.explicit_apply && cond.operator == Operator::Neq =>
            {
                FilterSpec::SetNeq(ids)
            }
            (InputType::Multiselect, true) => FilterSpec::AnyOf(ids),
            (InputType::Multiselect, false) => FilterSpec::NoneOf(ids),
            (_, true) => FilterSpec::In(ids.into_iter().map(Value::from).collect()),
            (_, false) => FilterSpec::Nin(ids.into_iter().map(Value::from).collect()),
        };

        Resolution {
            warning: resolution_warning,
            ..Resolution::new(
                path,
                cond,
                ResolvedLeaf::Attribute {
                    code: cond.attribute.clone(),
                    spec,
                },
            )
        }
    }

    /// 检查整棵树，返回所有非致命警告（供规则编辑界面展示）
    pub fn check_tree(&self, tree: &CombineNode) -> Vec<RuleWarning> {
        let mut warnings = Vec::new();
        tree.for_each_condition(|path, cond| {
            if let Some(warning) = self.resolve(path, cond).warning {
                warnings.push(warning);
            }
        });
        warnings
    }
}

/// 普通标量属性的过滤条件
fn plain_spec(operator: Operator, value: &Value) -> Option<FilterSpec> {
    let spec = match operator {
        Operator::Eq => FilterSpec::Eq(value.clone()),
        Operator::Neq => FilterSpec::Neq(value.clone()),
        Operator::Gt => FilterSpec::Gt(value.clone()),
        Operator::Gteq => FilterSpec::Gteq(value.clone()),
        Operator::Lt => FilterSpec::Lt(value.clone()),
        Operator::Lteq => FilterSpec::Lteq(value.clone()),
        Operator::Like => FilterSpec::Like(LikePattern::new(&evaluator::as_text(value))),
        Operator::Nlike => FilterSpec::Nlike(LikePattern::new(&evaluator::as_text(value))),
        Operator::Null => FilterSpec::Null,
        Operator::Notnull => FilterSpec::NotNull,
        Operator::In => FilterSpec::In(evaluator::value_list(value)),
        Operator::Nin => FilterSpec::Nin(evaluator::value_list(value)),
        Operator::MatchesSource | Operator::NotMatchesSource => return None,
    };
    Some(spec)
}

/// 条件值中是否包含非数字文本（即选项标签而不是选项 ID）
fn is_textual(value: &Value) -> bool {
    evaluator::value_list(value).iter().any(|item| match item {
        Value::String(s) => s.trim().parse::<i64>().is_err(),
        Value::Number(_) => false,
        _ => true,
    })
}
