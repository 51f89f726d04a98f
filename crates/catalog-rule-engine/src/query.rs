//! 可组合的商品查询
//!
//! [`QueryBuilder`] 描述一次对商品表的查询：属性过滤（单个与 OR 数组两种形式）、
//! 带自定义关联条件的表关联、去重、ID 范围和列投影。谓词下推只修改它，
//! 由 [`crate::catalog::CatalogSource`] 负责执行。每次评估使用独立的实例。

use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Write;

use crate::evaluator::FilterSpec;
use crate::models::ProductId;
use crate::product::EntityField;

/// 商品主表别名
pub const ENTITY_ALIAS: &str = "e";

/// 可关联的目录表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogTable {
    /// 分类与商品的多对多关联
    CategoryProduct,
    /// 库存记录
    StockItem,
}

impl CatalogTable {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CategoryProduct => "catalog_category_product",
            Self::StockItem => "cataloginventory_stock_item",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    fn keyword(&self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
        }
    }
}

/// 关联条件
#[derive(Debug, Clone, PartialEq)]
pub enum JoinClause {
    /// `alias.column = e.entity_id`
    ColumnEqEntityId(String),
    /// `alias.column = value`
    ColumnEqValue(String, Value),
}

/// 表关联
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub alias: String,
    pub table: CatalogTable,
    pub kind: JoinKind,
    pub on: Vec<JoinClause>,
}

impl JoinSpec {
    /// 按商品关联分类表，每个组使用独立别名
    pub fn category(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            table: CatalogTable::CategoryProduct,
            kind: JoinKind::Inner,
            on: vec![JoinClause::ColumnEqEntityId("product_id".to_string())],
        }
    }

    /// 左关联库存表：(product_id, 固定 stock_id)
    pub fn stock(stock_id: i64) -> Self {
        Self {
            alias: "stock".to_string(),
            table: CatalogTable::StockItem,
            kind: JoinKind::Left,
            on: vec![
                JoinClause::ColumnEqEntityId("product_id".to_string()),
                JoinClause::ColumnEqValue("stock_id".to_string(), Value::from(stock_id)),
            ],
        }
    }
}

/// 过滤条件引用的列
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnRef {
    /// 商品属性
    Attribute(String),
    /// 商品主表字段
    Entity(EntityField),
    /// 关联表上的列
    Joined { alias: String, column: String },
}

impl ColumnRef {
    pub fn joined(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Self::Joined {
            alias: alias.into(),
            column: column.into(),
        }
    }

    fn sql(&self) -> String {
        match self {
            Self::Attribute(code) => format!("{}.{}", ENTITY_ALIAS, code),
            Self::Entity(field) => format!("{}.{}", ENTITY_ALIAS, field.column()),
            Self::Joined { alias, column } => format!("{}.{}", alias, column),
        }
    }
}

/// WHERE 子句中的谓词，顶层谓词之间为 AND
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Filter {
        column: ColumnRef,
        spec: FilterSpec,
    },
    /// `e.entity_id [NOT] IN (SELECT product_id FROM table WHERE column IN values)`
    SubSelect {
        negate: bool,
        table: CatalogTable,
        column: String,
        values: BTreeSet<i64>,
    },
    /// 任一满足
    Any(Vec<Predicate>),
    /// 恒为 false
    False,
}

impl Predicate {
    pub fn attribute(code: impl Into<String>, spec: FilterSpec) -> Self {
        Self::Filter {
            column: ColumnRef::Attribute(code.into()),
            spec,
        }
    }

    /// 分类成员子查询
    pub fn category_membership(include: bool, ids: BTreeSet<i64>) -> Self {
        Self::SubSelect {
            negate: !include,
            table: CatalogTable::CategoryProduct,
            column: "category_id".to_string(),
            values: ids,
        }
    }

    fn sql(&self) -> String {
        match self {
            Self::Filter { column, spec } => filter_sql(&column.sql(), spec),
            Self::SubSelect {
                negate,
                table,
                column,
                values,
            } => {
                if values.is_empty() {
                    return if *negate { "1 = 1" } else { "1 = 0" }.to_string();
                }
                format!(
                    "{}.entity_id {}IN (SELECT product_id FROM {} WHERE {} IN ({}))",
                    ENTITY_ALIAS,
                    if *negate { "NOT " } else { "" },
                    table.name(),
                    column,
                    join_ids(values)
                )
            }
            Self::Any(items) if items.is_empty() => "1 = 0".to_string(),
            Self::Any(items) => format!(
                "({})",
                items.iter().map(Predicate::sql).collect::<Vec<_>>().join(" OR ")
            ),
            Self::False => "1 = 0".to_string(),
        }
    }
}

/// 列投影：数据源需要为每一行物化的数据
///
/// 商品主表字段总是加载；属性、分类和库存按需加载。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub attributes: BTreeSet<String>,
    pub categories: bool,
    /// 需要加载的库存 ID
    pub stock_id: Option<i64>,
}

impl Projection {
    /// 只需要商品 ID
    pub fn ids_only() -> Self {
        Self::default()
    }

    /// 合并另一个投影
    pub fn merge(&mut self, other: &Projection) {
        self.attributes.extend(other.attributes.iter().cloned());
        self.categories |= other.categories;
        if self.stock_id.is_none() {
            self.stock_id = other.stock_id;
        }
    }
}

/// 查询构建器
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    joins: Vec<JoinSpec>,
    predicates: Vec<Predicate>,
    distinct: bool,
    id_scope: Option<BTreeSet<ProductId>>,
    projection: Projection,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 单个属性过滤
    pub fn add_attribute_filter(&mut self, code: impl Into<String>, spec: FilterSpec) -> &mut Self {
        self.predicates.push(Predicate::attribute(code, spec));
        self
    }

    /// 属性过滤数组，任一满足即可
    pub fn add_attribute_filter_any(&mut self, filters: Vec<(String, FilterSpec)>) -> &mut Self {
        let items = filters
            .into_iter()
            .map(|(code, spec)| Predicate::attribute(code, spec))
            .collect();
        self.predicates.push(Predicate::Any(items));
        self
    }

    /// 添加表关联，同一别名只关联一次
    pub fn join_field(&mut self, join: JoinSpec) -> &mut Self {
        if !self.has_join(&join.alias) {
            self.joins.push(join);
        }
        self
    }

    pub fn add_where(&mut self, predicate: Predicate) -> &mut Self {
        self.predicates.push(predicate);
        self
    }

    /// 结果按商品去重
    pub fn distinct(&mut self) -> &mut Self {
        self.distinct = true;
        self
    }

    /// 限定商品 ID 范围（增量同步时只评估单个商品）
    pub fn restrict_ids(&mut self, ids: impl IntoIterator<Item = ProductId>) -> &mut Self {
        self.id_scope = Some(ids.into_iter().collect());
        self
    }

    pub fn project(&mut self, projection: Projection) -> &mut Self {
        self.projection = projection;
        self
    }

    pub fn has_join(&self, alias: &str) -> bool {
        self.joins.iter().any(|j| j.alias == alias)
    }

    pub fn joins(&self) -> &[JoinSpec] {
        &self.joins
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn id_scope(&self) -> Option<&BTreeSet<ProductId>> {
        self.id_scope.as_ref()
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// 渲染为 SQL（MySQL 方言），用于检查或交给关系型数据源执行
    pub fn to_sql(&self) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        let mut columns = vec![
            format!("{}.entity_id", ENTITY_ALIAS),
            format!("{}.type_id", ENTITY_ALIAS),
            format!("{}.visibility", ENTITY_ALIAS),
        ];
        columns.extend(
            self.projection
                .attributes
                .iter()
                .map(|code| format!("{}.{}", ENTITY_ALIAS, code)),
        );
        sql.push_str(&columns.join(", "));
        let _ = write!(sql, " FROM catalog_product_entity AS {}", ENTITY_ALIAS);

        for join in &self.joins {
            let on = join
                .on
                .iter()
                .map(|clause| match clause {
                    JoinClause::ColumnEqEntityId(column) => {
                        format!("{}.{} = {}.entity_id", join.alias, column, ENTITY_ALIAS)
                    }
                    JoinClause::ColumnEqValue(column, value) => {
                        format!("{}.{} = {}", join.alias, column, literal(value))
                    }
                })
                .collect::<Vec<_>>()
                .join(" AND ");
            let _ = write!(
                sql,
                " {} {} AS {} ON {}",
                join.kind.keyword(),
                join.table.name(),
                join.alias,
                on
            );
        }

        let mut clauses: Vec<String> = Vec::new();
        if let Some(ids) = &self.id_scope {
            clauses.push(if ids.is_empty() {
                "1 = 0".to_string()
            } else {
                format!("{}.entity_id IN ({})", ENTITY_ALIAS, join_ids(ids))
            });
        }
        clauses.extend(self.predicates.iter().map(Predicate::sql));

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql
    }
}

fn filter_sql(column: &str, spec: &FilterSpec) -> String {
    match spec {
        FilterSpec::Eq(v) => format!("{} = {}", column, literal(v)),
        FilterSpec::Neq(v) => format!("{} <> {}", column, literal(v)),
        FilterSpec::Gt(v) => format!("{} > {}", column, literal(v)),
        FilterSpec::Gteq(v) => format!("{} >= {}", column, literal(v)),
        FilterSpec::Lt(v) => format!("{} < {}", column, literal(v)),
        FilterSpec::Lteq(v) => format!("{} <= {}", column, literal(v)),
        FilterSpec::Like(p) => format!("{} LIKE {}", column, quote(p.sql_pattern())),
        FilterSpec::Nlike(p) => format!("{} NOT LIKE {}", column, quote(p.sql_pattern())),
        FilterSpec::Null => format!("{} IS NULL", column),
        FilterSpec::NotNull => format!("{} IS NOT NULL", column),
        FilterSpec::In(list) if list.is_empty() => "1 = 0".to_string(),
        FilterSpec::In(list) => format!("{} IN ({})", column, join_literals(list)),
        FilterSpec::Nin(list) if list.is_empty() => format!("{} IS NOT NULL", column),
        FilterSpec::Nin(list) => format!("{} NOT IN ({})", column, join_literals(list)),
        FilterSpec::AnyOf(set) if set.is_empty() => "1 = 0".to_string(),
        FilterSpec::AnyOf(set) => format!(
            "({})",
            set.iter()
                .map(|id| format!("FIND_IN_SET({}, {})", id, column))
                .collect::<Vec<_>>()
                .join(" OR ")
        ),
        FilterSpec::NoneOf(set) => {
            let mut parts = vec![format!("{} IS NOT NULL", column)];
            parts.extend(
                set.iter()
                    .map(|id| format!("NOT FIND_IN_SET({}, {})", id, column)),
            );
            format!("({})", parts.join(" AND "))
        }
        FilterSpec::SetEq(set) => format!("{} = {}", column, quote(&join_ids(set).replace(", ", ","))),
        FilterSpec::SetNeq(set) => {
            format!("{} <> {}", column, quote(&join_ids(set).replace(", ", ",")))
        }
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn join_literals(values: &[Value]) -> String {
    values.iter().map(literal).collect::<Vec<_>>().join(", ")
}

fn join_ids(ids: &BTreeSet<i64>) -> String {
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ")
}
