//! 规则树序列化
//!
//! 持久化格式：
//!
//! ```json
//! {
//!   "aggregator": "all",
//!   "negate": false,
//!   "conditions": [
//!     {"attribute": "color", "operator": "eq", "value": "Red"},
//!     {"aggregator": "any", "negate": false, "conditions": [...]}
//!   ]
//! }
//! ```
//!
//! 带 `attribute` 字段的对象是条件节点，否则是嵌套的组合节点。
//! 文档顶层可以附带 `ui` 字段，内容只供规则编辑界面使用，不参与评估。

use serde::de::{self, Deserializer};
use serde::Deserialize;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Result, RuleError};
use crate::models::{CombineNode, ConditionNode, Rule, RuleDocument, RuleNode, RuleWarning, TargetRef};
use crate::operators::{Aggregator, Operator};

/// 默认最大嵌套深度
///
/// 每层组合节点在 JSON 中占对象和数组两层，serde_json 解析文本时的递归上限为 128，
/// 所以文本形式最多约 64 层。更深的树只能以 `Value` 形式传入，并用
/// [`RuleSerializer::with_max_depth`] 放宽限制。
pub const DEFAULT_MAX_DEPTH: usize = 64;

const UI_KEY: &str = "ui";

/// 规则序列化器
#[derive(Debug, Clone)]
pub struct RuleSerializer {
    max_depth: usize,
}

impl RuleSerializer {
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn serialize(&self, tree: &CombineNode) -> Result<Value> {
        Ok(serde_json::to_value(tree)?)
    }

    pub fn to_json(&self, tree: &CombineNode) -> Result<String> {
        Ok(serde_json::to_string(tree)?)
    }

    /// 严格解析，格式错误时返回 `MalformedTree` 并指出出错位置
    pub fn deserialize(&self, value: &Value) -> Result<CombineNode> {
        self.parse_combine(value, "root", 1)
    }

    pub fn from_json(&self, json: &str) -> Result<CombineNode> {
        let value: Value = serde_json::from_str(json)?;
        self.deserialize(&value)
    }

    /// 宽松解析：格式错误时返回空树（不匹配任何商品）和一条警告
    pub fn deserialize_lenient(&self, value: &Value) -> (CombineNode, Option<RuleWarning>) {
        match self.deserialize(value) {
            Ok(tree) => (tree, None),
            Err(e) => {
                warn!(error = %e, "规则树格式错误，按空树处理");
                (
                    CombineNode::empty(),
                    Some(RuleWarning::MalformedTree {
                        message: e.to_string(),
                    }),
                )
            }
        }
    }

    /// 序列化文档（规则树 + 界面附加信息）
    pub fn serialize_document(&self, document: &RuleDocument) -> Result<Value> {
        let mut value = self.serialize(&document.tree)?;
        if let (Some(ui), Value::Object(map)) = (&document.ui, &mut value) {
            map.insert(UI_KEY.to_string(), Value::Object(ui.clone()));
        }
        Ok(value)
    }

    pub fn deserialize_document(&self, value: &Value) -> Result<RuleDocument> {
        let ui = match value.get(UI_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(other) => {
                return Err(RuleError::MalformedTree(format!(
                    "root.{}: 应为对象，实际为 {}",
                    UI_KEY,
                    crate::evaluator::type_name(other)
                )));
            }
        };
        Ok(RuleDocument {
            tree: self.deserialize(value)?,
            ui,
        })
    }

    fn parse_combine(&self, value: &Value, path: &str, depth: usize) -> Result<CombineNode> {
        if depth > self.max_depth {
            return Err(malformed(
                path,
                format!("嵌套深度超过上限 {}", self.max_depth),
            ));
        }

        let map = as_object(value, path)?;

        let aggregator = match map.get("aggregator") {
            None | Some(Value::Null) => Aggregator::All,
            Some(Value::String(s)) => s
                .to_lowercase()
                .parse::<Aggregator>()
                .map_err(|e| malformed(path, e.to_string()))?,
            Some(other) => return Err(wrong_type(path, "aggregator", "字符串", other)),
        };

        let negate = match map.get("negate") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            // 部分旧数据以 0/1 存储
            Some(Value::Number(n)) if n.as_i64().is_some_and(|v| v == 0 || v == 1) => {
                n.as_i64() == Some(1)
            }
            Some(other) => return Err(wrong_type(path, "negate", "布尔值", other)),
        };

        let conditions = match map.get("conditions") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let child_path = format!("{}.conditions[{}]", path, i);
                    self.parse_node(item, &child_path, depth)
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => return Err(wrong_type(path, "conditions", "数组", other)),
        };

        Ok(CombineNode {
            aggregator,
            negate,
            conditions,
        })
    }

    fn parse_node(&self, value: &Value, path: &str, depth: usize) -> Result<RuleNode> {
        let map = as_object(value, path)?;
        if map.contains_key("attribute") {
            Ok(RuleNode::Condition(Self::parse_condition(map, path)?))
        } else {
            Ok(RuleNode::Combine(self.parse_combine(value, path, depth + 1)?))
        }
    }

    fn parse_condition(map: &Map<String, Value>, path: &str) -> Result<ConditionNode> {
        let attribute = match map.get("attribute") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) => return Err(malformed(path, "attribute 不能为空")),
            Some(other) => return Err(wrong_type(path, "attribute", "字符串", other)),
            None => return Err(malformed(path, "缺少 attribute")),
        };

        let operator = match map.get("operator") {
            Some(Value::String(s)) => s
                .parse::<Operator>()
                .map_err(|e| malformed(path, e.to_string()))?,
            Some(other) => return Err(wrong_type(path, "operator", "字符串", other)),
            None => return Err(malformed(path, "缺少 operator")),
        };

        let explicit_apply = match map.get("explicit_apply") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => return Err(wrong_type(path, "explicit_apply", "布尔值", other)),
        };

        Ok(ConditionNode {
            attribute,
            operator,
            value: map.get("value").cloned().unwrap_or(Value::Null),
            explicit_apply,
        })
    }
}

impl Default for RuleSerializer {
    fn default() -> Self {
        Self::new()
    }
}

fn as_object<'v>(value: &'v Value, path: &str) -> Result<&'v Map<String, Value>> {
    value.as_object().ok_or_else(|| {
        malformed(
            path,
            format!("应为对象，实际为 {}", crate::evaluator::type_name(value)),
        )
    })
}

fn malformed(path: &str, message: impl AsRef<str>) -> RuleError {
    RuleError::MalformedTree(format!("{}: {}", path, message.as_ref()))
}

fn wrong_type(path: &str, field: &str, expected: &str, actual: &Value) -> RuleError {
    malformed(
        path,
        format!(
            "{} 应为{}，实际为 {}",
            field,
            expected,
            crate::evaluator::type_name(actual)
        ),
    )
}

impl<'de> Deserialize<'de> for CombineNode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        RuleSerializer::new()
            .deserialize(&value)
            .map_err(de::Error::custom)
    }
}

/// 规则的持久化格式
///
/// `root` 接受对象或 JSON 文本；格式错误时按空树加载并记录一条 `MalformedTree` 警告。
#[derive(Debug, Deserialize)]
pub struct StoredRule {
    id: String,
    name: String,
    target: TargetRef,
    root: Value,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl From<StoredRule> for Rule {
    fn from(stored: StoredRule) -> Self {
        let root = match stored.root {
            Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            other => other,
        };
        let (root, warning) = RuleSerializer::new().deserialize_lenient(&root);
        if warning.is_some() {
            warn!(rule_id = %stored.id, "规则树格式错误，按空树加载");
        }

        Rule {
            id: stored.id,
            name: stored.name,
            target: stored.target,
            root,
            is_active: stored.is_active,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            load_warnings: warning.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> CombineNode {
        CombineNode::all(vec![
            ConditionNode::new("color", Operator::Eq, "Red").into(),
            CombineNode::any(vec![
                ConditionNode::new("price", Operator::Gteq, 100).into(),
                ConditionNode::new("material", Operator::Eq, "1,2").explicit().into(),
                ConditionNode::source("category_ids", Operator::MatchesSource).into(),
            ])
            .negated()
            .into(),
            CombineNode::empty().into(),
        ])
    }

    #[test]
    fn test_round_trip() {
        let serializer = RuleSerializer::new();
        let tree = sample_tree();

        let value = serializer.serialize(&tree).unwrap();
        assert_eq!(serializer.deserialize(&value).unwrap(), tree);

        let json = serializer.to_json(&tree).unwrap();
        assert_eq!(serializer.from_json(&json).unwrap(), tree);
    }

    #[test]
    fn test_serialized_shape() {
        let tree = CombineNode::any(vec![ConditionNode::new("sku", Operator::Like, "AB").into()]);
        assert_eq!(
            RuleSerializer::new().serialize(&tree).unwrap(),
            json!({
                "aggregator": "any",
                "negate": false,
                "conditions": [{"attribute": "sku", "operator": "like", "value": "AB"}]
            })
        );
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let tree = RuleSerializer::new()
            .deserialize(&json!({"conditions": [{"attribute": "qty", "operator": "gt", "value": 1}]}))
            .unwrap();
        assert_eq!(tree.aggregator, Aggregator::All);
        assert!(!tree.negate);
        assert_eq!(tree.condition_count(), 1);
    }

    #[test]
    fn test_malformed_reports_path() {
        let err = RuleSerializer::new()
            .deserialize(&json!({
                "aggregator": "all",
                "conditions": [
                    {"attribute": "color", "operator": "eq", "value": 1},
                    {"aggregator": "any", "conditions": [{"attribute": "x", "operator": "between"}]}
                ]
            }))
            .unwrap_err();

        assert_eq!(err.code(), "MALFORMED_TREE");
        assert!(err.to_string().contains("root.conditions[1].conditions[0]"));
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!({"aggregator": "all", "conditions": []});
        for _ in 0..5 {
            value = json!({"aggregator": "all", "conditions": [value]});
        }

        let serializer = RuleSerializer::new().with_max_depth(4);
        assert!(serializer.deserialize(&value).is_err());
        assert!(RuleSerializer::new().deserialize(&value).is_ok());
    }

    #[test]
    fn test_deep_tree_round_trips_with_raised_limit() {
        let mut tree = CombineNode::all(vec![ConditionNode::new("price", Operator::Gt, 1).into()]);
        for level in 0..100 {
            let node = if level % 2 == 0 {
                CombineNode::any(vec![tree.into()])
            } else {
                CombineNode::all(vec![tree.into()]).negated()
            };
            tree = node;
        }
        assert_eq!(tree.depth(), 101);

        let value = RuleSerializer::new().serialize(&tree).unwrap();
        assert!(RuleSerializer::new().deserialize(&value).is_err());

        let serializer = RuleSerializer::new().with_max_depth(128);
        assert_eq!(serializer.deserialize(&value).unwrap(), tree);
    }

    #[test]
    fn test_lenient_falls_back_to_empty_tree() {
        let (tree, warning) = RuleSerializer::new().deserialize_lenient(&json!([1, 2, 3]));
        assert!(tree.is_empty());
        assert!(matches!(warning, Some(RuleWarning::MalformedTree { .. })));
    }

    #[test]
    fn test_document_ui_side_channel() {
        let serializer = RuleSerializer::new();
        let mut ui = Map::new();
        ui.insert("collapsed".to_string(), json!(["root.conditions[1]"]));
        let document = RuleDocument {
            tree: sample_tree(),
            ui: Some(ui),
        };

        let value = serializer.serialize_document(&document).unwrap();
        assert!(value.get("ui").is_some());
        // 核心语法忽略 ui
        assert_eq!(serializer.deserialize(&value).unwrap(), document.tree);
        assert_eq!(serializer.deserialize_document(&value).unwrap(), document);
    }

    #[test]
    fn test_rule_with_corrupt_root_matches_nothing() {
        let rule: Rule = serde_json::from_value(json!({
            "id": "r-1",
            "name": "broken",
            "target": {"kind": "category", "id": 3},
            "root": {"aggregator": "sometimes"}
        }))
        .unwrap();
        assert!(rule.root.is_empty());
        assert!(matches!(
            rule.load_warnings.as_slice(),
            [RuleWarning::MalformedTree { .. }]
        ));

        let rule: Rule = serde_json::from_value(json!({
            "id": "r-2",
            "name": "stored as text",
            "target": {"kind": "feed", "id": 1},
            "root": "{\"aggregator\":\"any\",\"conditions\":[{\"attribute\":\"sku\",\"operator\":\"null\"}]}"
        }))
        .unwrap();
        assert_eq!(rule.root.condition_count(), 1);
        assert!(rule.load_warnings.is_empty());

        // 警告不写回持久化格式
        let value = serde_json::to_value(&rule).unwrap();
        assert!(value.get("load_warnings").is_none());
    }

    #[test]
    fn test_combine_node_serde_is_strict() {
        let result: std::result::Result<CombineNode, _> =
            serde_json::from_value(json!({"conditions": "nope"}));
        assert!(result.is_err());
    }
}
