//! 规则操作符定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RuleError;

/// 条件操作符
///
/// 操作符集合是封闭的，每种属性类型只接受其中的一个子集，见
/// [`crate::attribute::LeafKind::allowed_operators`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    // 标量比较
    Eq,
    Neq,
    Gt,
    Gteq,
    Lt,
    Lteq,
    Like,
    Nlike,

    // 空值检查
    Null,
    Notnull,

    // 集合成员
    In,
    Nin,

    // 与参照商品比较
    MatchesSource,
    NotMatchesSource,
}

impl Operator {
    pub const ALL: [Operator; 14] = [
        Self::Eq,
        Self::Neq,
        Self::Gt,
        Self::Gteq,
        Self::Lt,
        Self::Lteq,
        Self::Like,
        Self::Nlike,
        Self::Null,
        Self::Notnull,
        Self::In,
        Self::Nin,
        Self::MatchesSource,
        Self::NotMatchesSource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gteq => "gteq",
            Self::Lt => "lt",
            Self::Lteq => "lteq",
            Self::Like => "like",
            Self::Nlike => "nlike",
            Self::Null => "null",
            Self::Notnull => "notnull",
            Self::In => "in",
            Self::Nin => "nin",
            Self::MatchesSource => "matches_source",
            Self::NotMatchesSource => "not_matches_source",
        }
    }

    /// 是否为否定类操作符（neq / nlike / nin / not_matches_source）
    pub fn is_negative(&self) -> bool {
        matches!(
            self,
            Self::Neq | Self::Nlike | Self::Nin | Self::NotMatchesSource
        )
    }

    /// 是否需要参照商品
    pub fn is_source_comparison(&self) -> bool {
        matches!(self, Self::MatchesSource | Self::NotMatchesSource)
    }

    /// 是否不需要比较值
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::Null | Self::Notnull) || self.is_source_comparison()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|op| op.as_str() == s)
            .copied()
            .ok_or_else(|| RuleError::ParseError(format!("未知操作符: '{}'", s)))
    }
}

/// 组合节点的聚合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    All,
    Any,
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::Any => write!(f, "ANY"),
        }
    }
}

impl FromStr for Aggregator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            other => Err(RuleError::ParseError(format!("未知聚合方式: '{}'", other))),
        }
    }
}
