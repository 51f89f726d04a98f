//! 规则引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("规则解析失败: {0}")]
    ParseError(String),

    #[error("规则树格式错误: {0}")]
    MalformedTree(String),

    #[error("无法解析属性: {0}")]
    UnresolvableAttribute(String),

    #[error("无效的操作符: {operator} 不支持属性类型 {kind}")]
    InvalidOperator { operator: String, kind: String },

    #[error("目标成员写入失败: {target} - {message}")]
    TargetWriteFailure { target: String, message: String },

    #[error("数据源错误: {0}")]
    SourceError(String),

    #[error("扫描超出预算: {0}")]
    BudgetExceeded(String),

    #[error("规则未找到: {0}")]
    RuleNotFound(String),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl RuleError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::ParseError(_) => "PARSE_ERROR",
            Self::MalformedTree(_) => "MALFORMED_TREE",
            Self::UnresolvableAttribute(_) => "UNRESOLVABLE_ATTRIBUTE",
            Self::InvalidOperator { .. } => "INVALID_OPERATOR",
            Self::TargetWriteFailure { .. } => "TARGET_WRITE_FAILURE",
            Self::SourceError(_) => "SOURCE_ERROR",
            Self::BudgetExceeded(_) => "BUDGET_EXCEEDED",
            Self::RuleNotFound(_) => "RULE_NOT_FOUND",
            Self::JsonError(_) => "JSON_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = RuleError::TargetWriteFailure {
            target: "category:3".to_string(),
            message: "deadlock".to_string(),
        };
        assert_eq!(err.code(), "TARGET_WRITE_FAILURE");
        assert!(err.to_string().contains("category:3"));
    }
}
