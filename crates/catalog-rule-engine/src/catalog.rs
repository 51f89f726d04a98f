//! 商品数据源
//!
//! [`CatalogSource`] 执行 [`QueryBuilder`] 描述的查询，以只进游标的形式逐行返回
//! 按投影列表物化的 [`ProductRow`]。[`MemoryCatalog`] 是基于内存表的实现，
//! 供测试、基准和命令行工具使用。

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::error::Result;
use crate::models::ProductId;
use crate::product::{EntityField, ProductRow, StockItem};
use crate::query::{
    CatalogTable, ColumnRef, JoinClause, JoinKind, JoinSpec, Predicate, Projection, QueryBuilder,
};

/// 逐行返回的商品流
pub type RowStream<'a> = Box<dyn Iterator<Item = Result<ProductRow>> + 'a>;

/// 可查询的商品数据源
pub trait CatalogSource: Send + Sync {
    /// 执行查询并以只进游标的形式返回结果
    fn stream(&self, query: &QueryBuilder) -> Result<RowStream<'_>>;

    /// 按 ID 加载单个商品
    fn load(&self, id: ProductId, projection: &Projection) -> Result<Option<ProductRow>> {
        let mut query = QueryBuilder::new();
        query.restrict_ids([id]).project(projection.clone());
        self.stream(&query)?.next().transpose()
    }
}

/// 商品主表记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: ProductId,
    #[serde(default)]
    pub type_id: Option<String>,
    #[serde(default)]
    pub visibility: Option<i64>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ProductRecord {
    fn field(&self, field: EntityField) -> Option<Value> {
        match field {
            EntityField::EntityId => Some(Value::from(self.id)),
            EntityField::TypeId => self.type_id.clone().map(Value::from),
            EntityField::Visibility => self.visibility.map(Value::from),
        }
    }
}

/// 分类关联记录，同一商品可以在同一分类下出现多次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryLink {
    pub category_id: i64,
    pub product_id: ProductId,
    #[serde(default)]
    pub position: i32,
}

impl CategoryLink {
    fn column(&self, name: &str) -> Option<Value> {
        match name {
            "category_id" => Some(Value::from(self.category_id)),
            "product_id" => Some(Value::from(self.product_id)),
            "position" => Some(Value::from(self.position)),
            _ => None,
        }
    }
}

/// 商品数据快照（命令行工具的输入格式）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub products: Vec<ProductRecord>,
    #[serde(default)]
    pub category_links: Vec<CategoryLink>,
    #[serde(default)]
    pub stock_items: Vec<StockItem>,
}

#[derive(Debug, Default)]
struct Tables {
    products: BTreeMap<ProductId, ProductRecord>,
    category_links: BTreeMap<ProductId, Vec<CategoryLink>>,
    stock_items: BTreeMap<ProductId, Vec<StockItem>>,
}

/// 内存商品数据源
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: RwLock<Tables>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        let catalog = Self::new();
        for product in snapshot.products {
            catalog.upsert_product(product);
        }
        for link in snapshot.category_links {
            catalog.insert_category_link(link);
        }
        for item in snapshot.stock_items {
            catalog.set_stock(item);
        }
        catalog
    }

    pub fn upsert_product(&self, product: ProductRecord) {
        self.tables.write().products.insert(product.id, product);
    }

    /// 删除商品及其关联记录
    pub fn remove_product(&self, id: ProductId) -> Option<ProductRecord> {
        let mut tables = self.tables.write();
        tables.category_links.remove(&id);
        tables.stock_items.remove(&id);
        tables.products.remove(&id)
    }

    /// 设置单个属性值，null 表示清除
    pub fn set_attribute(&self, id: ProductId, code: &str, value: Value) {
        let mut tables = self.tables.write();
        if let Some(product) = tables.products.get_mut(&id) {
            if value.is_null() {
                product.attributes.remove(code);
            } else {
                product.attributes.insert(code.to_string(), value);
            }
        }
    }

    pub fn link_category(&self, category_id: i64, product_id: ProductId) {
        self.insert_category_link(CategoryLink {
            category_id,
            product_id,
            position: 0,
        });
    }

    /// 写入一条分类关联记录，保留其排序位置
    pub fn insert_category_link(&self, link: CategoryLink) {
        self.tables
            .write()
            .category_links
            .entry(link.product_id)
            .or_default()
            .push(link);
    }

    pub fn unlink_category(&self, category_id: i64, product_id: ProductId) {
        if let Some(links) = self.tables.write().category_links.get_mut(&product_id) {
            links.retain(|link| link.category_id != category_id);
        }
    }

    /// 写入库存记录，(product_id, stock_id) 唯一
    pub fn set_stock(&self, item: StockItem) {
        let mut tables = self.tables.write();
        let items = tables.stock_items.entry(item.product_id).or_default();
        items.retain(|existing| existing.stock_id != item.stock_id);
        items.push(item);
    }

    pub fn len(&self) -> usize {
        self.tables.read().products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().products.is_empty()
    }

    pub fn product_ids(&self) -> Vec<ProductId> {
        self.tables.read().products.keys().copied().collect()
    }
}

impl CatalogSource for MemoryCatalog {
    fn stream(&self, query: &QueryBuilder) -> Result<RowStream<'_>> {
        Ok(Box::new(MemoryCursor {
            tables: self.tables.read(),
            query: query.clone(),
            position: Bound::Unbounded,
            pending: Vec::new(),
        }))
    }
}

/// 内存表上的只进游标，持有读锁直到游标释放
struct MemoryCursor<'a> {
    tables: RwLockReadGuard<'a, Tables>,
    query: QueryBuilder,
    position: Bound<ProductId>,
    pending: Vec<ProductRow>,
}

/// 一行关联结果中各别名绑定的记录
#[derive(Clone, Copy)]
enum JoinedRecord<'a> {
    Category(&'a CategoryLink),
    Stock(&'a StockItem),
}

impl JoinedRecord<'_> {
    fn column(&self, name: &str) -> Option<Value> {
        match self {
            Self::Category(link) => link.column(name),
            Self::Stock(item) => item.column(name),
        }
    }
}

type Bindings<'a> = Vec<(&'a str, Option<JoinedRecord<'a>>)>;

impl Iterator for MemoryCursor<'_> {
    type Item = Result<ProductRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.pending.pop() {
                return Some(Ok(row));
            }

            // 限定了 ID 范围时直接按范围定位，不扫描全表
            let next = match self.query.id_scope() {
                Some(scope) => scope
                    .range((self.position, Bound::Unbounded))
                    .find_map(|id| self.tables.products.get_key_value(id)),
                None => self
                    .tables
                    .products
                    .range((self.position, Bound::Unbounded))
                    .next(),
            };
            let (id, product) = next?;
            self.position = Bound::Excluded(*id);

            let matched = matching_row_count(&self.tables, &self.query, product);
            if matched == 0 {
                continue;
            }

            let copies = if self.query.is_distinct() { 1 } else { matched };
            let row = materialize(&self.tables, product, self.query.projection());
            self.pending = vec![row; copies];
        }
    }
}

/// 展开关联后满足所有谓词的行数
///
/// 按关联顺序深度优先展开，每个谓词在它引用的最后一个别名绑定后立即求值，
/// 不满足的分支不再继续展开。DISTINCT 查询找到一行即停止。
fn matching_row_count(tables: &Tables, query: &QueryBuilder, product: &ProductRecord) -> usize {
    let joins = query.joins();
    let stages = query
        .predicates()
        .iter()
        .map(|predicate| ready_stage(predicate, joins))
        .collect();
    let search = JoinSearch {
        tables,
        product,
        joins,
        predicates: query.predicates(),
        stages,
        limit: if query.is_distinct() { 1 } else { usize::MAX },
    };
    search.count(0, &mut Vec::with_capacity(joins.len()))
}

/// 谓词可以求值时已绑定的关联数
fn ready_stage(predicate: &Predicate, joins: &[JoinSpec]) -> usize {
    match predicate {
        Predicate::Filter {
            column: ColumnRef::Joined { alias, .. },
            ..
        } => joins
            .iter()
            .position(|join| join.alias == *alias)
            .map_or(joins.len(), |i| i + 1),
        Predicate::Any(items) => items
            .iter()
            .map(|item| ready_stage(item, joins))
            .max()
            .unwrap_or(0),
        _ => 0,
    }
}

struct JoinSearch<'a> {
    tables: &'a Tables,
    product: &'a ProductRecord,
    joins: &'a [JoinSpec],
    predicates: &'a [Predicate],
    stages: Vec<usize>,
    limit: usize,
}

impl<'a> JoinSearch<'a> {
    fn count(&self, depth: usize, bindings: &mut Bindings<'a>) -> usize {
        let ready = self
            .predicates
            .iter()
            .zip(&self.stages)
            .filter(|(_, stage)| **stage == depth);
        for (predicate, _) in ready {
            if !eval_predicate(self.tables, predicate, self.product, bindings) {
                return 0;
            }
        }

        let joins: &'a [JoinSpec] = self.joins;
        let Some(join) = joins.get(depth) else {
            return 1;
        };
        let candidates = join_candidates(self.tables, join, self.product.id);
        if candidates.is_empty() {
            if join.kind != JoinKind::Left {
                return 0;
            }
            bindings.push((join.alias.as_str(), None));
            let matched = self.count(depth + 1, bindings);
            bindings.pop();
            return matched;
        }

        let mut matched = 0usize;
        for candidate in candidates {
            bindings.push((join.alias.as_str(), Some(candidate)));
            matched = matched.saturating_add(self.count(depth + 1, bindings));
            bindings.pop();
            if matched >= self.limit {
                break;
            }
        }
        matched
    }
}

fn join_candidates<'a>(
    tables: &'a Tables,
    join: &JoinSpec,
    product_id: ProductId,
) -> Vec<JoinedRecord<'a>> {
    let records: Vec<JoinedRecord<'a>> = match join.table {
        CatalogTable::CategoryProduct => tables
            .category_links
            .get(&product_id)
            .map(|links| links.iter().map(JoinedRecord::Category).collect())
            .unwrap_or_default(),
        CatalogTable::StockItem => tables
            .stock_items
            .get(&product_id)
            .map(|items| items.iter().map(JoinedRecord::Stock).collect())
            .unwrap_or_default(),
    };

    records
        .into_iter()
        .filter(|record| {
            join.on.iter().all(|clause| match clause {
                JoinClause::ColumnEqEntityId(column) => {
                    record.column(column) == Some(Value::from(product_id))
                }
                JoinClause::ColumnEqValue(column, value) => record
                    .column(column)
                    .is_some_and(|actual| crate::evaluator::loose_eq(&actual, value)),
            })
        })
        .collect()
}

fn eval_predicate(
    tables: &Tables,
    predicate: &Predicate,
    product: &ProductRecord,
    bindings: &Bindings<'_>,
) -> bool {
    match predicate {
        Predicate::Filter { column, spec } => match column {
            ColumnRef::Attribute(code) => spec.matches(product.attributes.get(code)),
            ColumnRef::Entity(field) => spec.matches(product.field(*field).as_ref()),
            ColumnRef::Joined { alias, column } => {
                let value = bindings
                    .iter()
                    .find(|(bound, _)| *bound == alias.as_str())
                    .and_then(|(_, record)| record.as_ref())
                    .and_then(|record| record.column(column));
                spec.matches(value.as_ref())
            }
        },
        Predicate::SubSelect {
            negate,
            table,
            column,
            values,
        } => {
            let exists = match table {
                CatalogTable::CategoryProduct => tables
                    .category_links
                    .get(&product.id)
                    .is_some_and(|links| {
                        links.iter().any(|link| {
                            link.column(column)
                                .and_then(|v| v.as_i64())
                                .is_some_and(|v| values.contains(&v))
                        })
                    }),
                CatalogTable::StockItem => tables.stock_items.get(&product.id).is_some_and(|items| {
                    items.iter().any(|item| {
                        item.column(column)
                            .and_then(|v| v.as_i64())
                            .is_some_and(|v| values.contains(&v))
                    })
                }),
            };
            exists != *negate
        }
        Predicate::Any(items) => items
            .iter()
            .any(|item| eval_predicate(tables, item, product, bindings)),
        Predicate::False => false,
    }
}

fn materialize(tables: &Tables, product: &ProductRecord, projection: &Projection) -> ProductRow {
    let attributes = projection
        .attributes
        .iter()
        .filter_map(|code| {
            product
                .attributes
                .get(code)
                .map(|value| (code.clone(), value.clone()))
        })
        .collect();

    let category_ids: BTreeSet<i64> = if projection.categories {
        tables
            .category_links
            .get(&product.id)
            .map(|links| links.iter().map(|link| link.category_id).collect())
            .unwrap_or_default()
    } else {
        BTreeSet::new()
    };

    let stock = projection.stock_id.and_then(|stock_id| {
        tables
            .stock_items
            .get(&product.id)
            .and_then(|items| items.iter().find(|item| item.stock_id == stock_id))
            .cloned()
    });

    ProductRow {
        id: product.id,
        type_id: product.type_id.clone(),
        visibility: product.visibility,
        category_ids,
        stock,
        attributes,
    }
}
