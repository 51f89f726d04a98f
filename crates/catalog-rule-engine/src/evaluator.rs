//! 过滤条件评估器
//!
//! [`FilterSpec`] 是单个列上的比较语义。逐对象评估和谓词下推共用同一份实现，
//! 内存数据源执行下推后的查询时也调用这里的 [`FilterSpec::matches`]。
//!
//! 空值语义与 SQL 保持一致：字段缺失或为 null 时，除 `null` 外的所有比较都为 false。

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// 单列过滤条件
#[derive(Debug, Clone, PartialEq)]
pub enum FilterSpec {
    Eq(Value),
    Neq(Value),
    Gt(Value),
    Gteq(Value),
    Lt(Value),
    Lteq(Value),
    Like(LikePattern),
    Nlike(LikePattern),
    Null,
    NotNull,
    In(Vec<Value>),
    Nin(Vec<Value>),
    /// 多选属性：存储的选项集合与给定集合有交集
    AnyOf(BTreeSet<i64>),
    /// 多选属性：存储的选项集合与给定集合无交集
    NoneOf(BTreeSet<i64>),
    /// 多选属性：存储的选项集合与给定集合完全相等
    SetEq(BTreeSet<i64>),
    SetNeq(BTreeSet<i64>),
}

impl FilterSpec {
    /// 判断列值是否满足条件
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Null => return is_null(value),
            Self::NotNull => return !is_null(value),
            _ => {}
        }

        let value = match value {
            Some(v) if !v.is_null() => v,
            _ => return false,
        };

        match self {
            Self::Eq(expected) => loose_eq(value, expected),
            Self::Neq(expected) => !loose_eq(value, expected),
            Self::Gt(expected) => compare(value, expected) == Some(Ordering::Greater),
            Self::Gteq(expected) => matches!(
                compare(value, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt(expected) => compare(value, expected) == Some(Ordering::Less),
            Self::Lteq(expected) => matches!(
                compare(value, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::Like(pattern) => pattern.is_match(&as_text(value)),
            Self::Nlike(pattern) => !pattern.is_match(&as_text(value)),
            Self::In(list) => list.iter().any(|item| loose_eq(value, item)),
            Self::Nin(list) => !list.iter().any(|item| loose_eq(value, item)),
            Self::AnyOf(set) => option_ids(value).is_some_and(|ids| !ids.is_disjoint(set)),
            Self::NoneOf(set) => option_ids(value).is_some_and(|ids| ids.is_disjoint(set)),
            Self::SetEq(set) => option_ids(value).is_some_and(|ids| &ids == set),
            Self::SetNeq(set) => option_ids(value).is_some_and(|ids| &ids != set),
            Self::Null | Self::NotNull => unreachable!(),
        }
    }

    /// 操作符名称（用于日志与追踪）
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eq(_) => "eq",
            Self::Neq(_) => "neq",
            Self::Gt(_) => "gt",
            Self::Gteq(_) => "gteq",
            Self::Lt(_) => "lt",
            Self::Lteq(_) => "lteq",
            Self::Like(_) => "like",
            Self::Nlike(_) => "nlike",
            Self::Null => "null",
            Self::NotNull => "notnull",
            Self::In(_) => "in",
            Self::Nin(_) => "nin",
            Self::AnyOf(_) => "any_of",
            Self::NoneOf(_) => "none_of",
            Self::SetEq(_) => "set_eq",
            Self::SetNeq(_) => "set_neq",
        }
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(v) | Self::Neq(v) | Self::Gt(v) | Self::Gteq(v) | Self::Lt(v) | Self::Lteq(v) => {
                write!(f, "{} {}", self.name(), v)
            }
            Self::Like(p) | Self::Nlike(p) => write!(f, "{} '{}'", self.name(), p.sql_pattern()),
            Self::Null | Self::NotNull => f.write_str(self.name()),
            Self::In(list) | Self::Nin(list) => write!(f, "{} {}", self.name(), Value::from(list.clone())),
            Self::AnyOf(set) | Self::NoneOf(set) | Self::SetEq(set) | Self::SetNeq(set) => {
                write!(f, "{} {:?}", self.name(), set)
            }
        }
    }
}

/// LIKE 模式
///
/// 支持 `%`（任意长度）和 `_`（单个字符）通配符，大小写不敏感。
/// 不含 `%` 的模式按子串匹配处理，即视为 `%value%`。
#[derive(Debug, Clone)]
pub struct LikePattern {
    pattern: String,
    /// 字面量全部转义，编译总会成功；失败时不匹配任何文本
    regex: Option<Regex>,
}

impl LikePattern {
    pub fn new(raw: &str) -> Self {
        let pattern = if raw.contains('%') {
            raw.to_string()
        } else {
            format!("%{}%", raw)
        };

        let mut expr = String::from("(?is)^");
        let mut literal = String::new();
        for ch in pattern.chars() {
            match ch {
                '%' | '_' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if ch == '%' { ".*" } else { "." });
                }
                _ => literal.push(ch),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        Self {
            pattern,
            regex: Regex::new(&expr).ok(),
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(text))
    }

    /// 带通配符的 SQL 模式
    pub fn sql_pattern(&self) -> &str {
        &self.pattern
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

/// 判断值是否为空
pub fn is_null(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// 宽松相等比较
///
/// 数值统一转为浮点数比较（100 == 100.0 == "100"），字符串大小写不敏感。
pub fn loose_eq(field: &Value, expected: &Value) -> bool {
    if let (Some(f1), Some(f2)) = (as_f64(field), as_f64(expected)) {
        return (f1 - f2).abs() < f64::EPSILON;
    }

    match (field, expected) {
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        _ => field == expected,
    }
}

/// 顺序比较：数值优先，其次日期时间，最后按字符串
pub fn compare(field: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_f64(field), as_f64(expected)) {
        return a.partial_cmp(&b);
    }

    if let (Some(a), Some(b)) = (parse_datetime(field), parse_datetime(expected)) {
        return Some(a.cmp(&b));
    }

    match (field, expected) {
        (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        _ => None,
    }
}

/// 解析日期时间
///
/// 支持 RFC 3339、`%Y-%m-%d %H:%M:%S` 以及纯日期 `%Y-%m-%d`。
pub fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// 尝试将 Value 转换为 f64
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// 转为文本（用于 LIKE）
pub fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(as_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

/// 解析多选属性存储的选项 ID 集合
///
/// 兼容数组（`[1, 2]`、`["1", "2"]`）、逗号分隔字符串（`"1,2"`）和单个数值。
pub fn option_ids(value: &Value) -> Option<BTreeSet<i64>> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(items.iter().filter_map(as_i64).collect()),
        Value::String(s) => Some(
            s.split(',')
                .filter_map(|part| part.trim().parse::<i64>().ok())
                .collect(),
        ),
        other => as_i64(other).map(|id| BTreeSet::from([id])),
    }
}

/// 转为整数 ID
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 将条件值展开为列表
///
/// 数组按元素展开，字符串按逗号拆分，其他标量作为单元素列表。
pub fn value_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.clone(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| Value::String(part.to_string()))
            .collect(),
        other => vec![other.clone()],
    }
}

/// 将条件值展开为整数 ID 集合，无法解析的元素被忽略
pub fn id_set(value: &Value) -> BTreeSet<i64> {
    value_list(value).iter().filter_map(as_i64).collect()
}

/// 获取值的类型名称
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
