//! 商品行视图
//!
//! 逐对象评估只通过 [`ProductView`] 读取商品数据，不依赖具体的数据源实现。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::models::ProductId;

/// 库存记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockItem {
    pub product_id: ProductId,
    #[serde(default = "default_stock_id")]
    pub stock_id: i64,
    #[serde(default)]
    pub qty: f64,
    #[serde(default)]
    pub is_in_stock: bool,
}

fn default_stock_id() -> i64 {
    1
}

impl StockItem {
    pub fn new(product_id: ProductId, stock_id: i64, qty: f64, is_in_stock: bool) -> Self {
        Self {
            product_id,
            stock_id,
            qty,
            is_in_stock,
        }
    }

    /// 按列名读取（与库存表列名一致）
    pub fn column(&self, name: &str) -> Option<Value> {
        match name {
            "product_id" => Some(Value::from(self.product_id)),
            "stock_id" => Some(Value::from(self.stock_id)),
            "qty" => Some(Value::from(self.qty)),
            "is_in_stock" => Some(Value::from(self.is_in_stock)),
            _ => None,
        }
    }
}

/// 商品实体表上的固定字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityField {
    EntityId,
    TypeId,
    Visibility,
}

impl EntityField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::EntityId => "entity_id",
            Self::TypeId => "type_id",
            Self::Visibility => "visibility",
        }
    }

    pub fn from_column(name: &str) -> Option<Self> {
        match name {
            "entity_id" => Some(Self::EntityId),
            "type_id" => Some(Self::TypeId),
            "visibility" => Some(Self::Visibility),
            _ => None,
        }
    }
}

/// 库存表上可参与比较的列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StockField {
    Qty,
    IsInStock,
}

impl StockField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Qty => "qty",
            Self::IsInStock => "is_in_stock",
        }
    }
}

/// 商品行视图
pub trait ProductView {
    fn id(&self) -> ProductId;
    fn attribute(&self, code: &str) -> Option<&Value>;
    fn type_id(&self) -> Option<&str>;
    fn visibility(&self) -> Option<i64>;
    fn category_ids(&self) -> &BTreeSet<i64>;
    /// 配置的库存 ID 对应的库存记录
    fn stock(&self) -> Option<&StockItem>;

    /// 读取实体字段
    fn field(&self, field: EntityField) -> Option<Value> {
        match field {
            EntityField::EntityId => Some(Value::from(self.id())),
            EntityField::TypeId => self.type_id().map(Value::from),
            EntityField::Visibility => self.visibility().map(Value::from),
        }
    }

    /// 读取库存列，没有库存记录时为 None
    fn stock_value(&self, field: StockField) -> Option<Value> {
        self.stock().and_then(|item| item.column(field.column()))
    }
}

/// 物化后的商品行
///
/// 数据源按投影列表填充，未请求的属性不会出现在 `attributes` 中。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRow {
    pub id: ProductId,
    #[serde(default)]
    pub type_id: Option<String>,
    #[serde(default)]
    pub visibility: Option<i64>,
    #[serde(default)]
    pub category_ids: BTreeSet<i64>,
    #[serde(default)]
    pub stock: Option<StockItem>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ProductRow {
    pub fn new(id: ProductId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn with_type(mut self, type_id: impl Into<String>) -> Self {
        self.type_id = Some(type_id.into());
        self
    }

    pub fn with_visibility(mut self, visibility: i64) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn with_categories(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.category_ids = ids.into_iter().collect();
        self
    }

    pub fn with_stock(mut self, qty: f64, is_in_stock: bool) -> Self {
        self.stock = Some(StockItem::new(self.id, 1, qty, is_in_stock));
        self
    }

    pub fn with_attribute(mut self, code: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(code.into(), value.into());
        self
    }
}

impl ProductView for ProductRow {
    fn id(&self) -> ProductId {
        self.id
    }

    fn attribute(&self, code: &str) -> Option<&Value> {
        self.attributes.get(code)
    }

    fn type_id(&self) -> Option<&str> {
        self.type_id.as_deref()
    }

    fn visibility(&self) -> Option<i64> {
        self.visibility
    }

    fn category_ids(&self) -> &BTreeSet<i64> {
        &self.category_ids
    }

    fn stock(&self) -> Option<&StockItem> {
        self.stock.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_view() {
        let row = ProductRow::new(7)
            .with_type("simple")
            .with_visibility(4)
            .with_categories([3, 5])
            .with_stock(12.0, true)
            .with_attribute("color", 14);

        assert_eq!(row.field(EntityField::EntityId), Some(json!(7)));
        assert_eq!(row.field(EntityField::TypeId), Some(json!("simple")));
        assert_eq!(row.field(EntityField::Visibility), Some(json!(4)));
        assert_eq!(row.stock_value(StockField::Qty), Some(json!(12.0)));
        assert_eq!(row.stock_value(StockField::IsInStock), Some(json!(true)));
        assert_eq!(row.attribute("color"), Some(&json!(14)));
        assert!(row.category_ids().contains(&5));
    }

    #[test]
    fn test_missing_stock() {
        let row = ProductRow::new(1);
        assert_eq!(row.stock_value(StockField::Qty), None);
        assert_eq!(row.field(EntityField::TypeId), None);
    }
}
