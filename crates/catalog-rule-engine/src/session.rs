//! 评估会话
//!
//! 由调用方显式创建并传入的匹配结果缓存，键为（规则 ID，可选的单商品范围）。
//! 规则对象本身不保存任何评估状态，同一规则可以被并发评估。

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::matcher::Strategy;
use crate::models::{MatchResult, ProductId, RuleWarning};

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub rule_id: String,
    /// None 表示全量评估
    pub scope: Option<ProductId>,
}

impl SessionKey {
    pub fn full(rule_id: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            scope: None,
        }
    }

    pub fn scoped(rule_id: impl Into<String>, product_id: ProductId) -> Self {
        Self {
            rule_id: rule_id.into(),
            scope: Some(product_id),
        }
    }
}

/// 缓存的匹配结果：ID 集合、实际使用的策略和评估时的警告
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub ids: Arc<MatchResult>,
    pub strategy: Strategy,
    pub warnings: Vec<RuleWarning>,
}

impl SessionEntry {
    pub fn new(ids: MatchResult, strategy: Strategy, warnings: Vec<RuleWarning>) -> Self {
        Self {
            ids: Arc::new(ids),
            strategy,
            warnings,
        }
    }
}

/// 会话统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// 评估会话
#[derive(Debug, Default)]
pub struct EvaluationSession {
    results: DashMap<SessionKey, SessionEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EvaluationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionEntry> {
        let cached = self.results.get(key).map(|entry| entry.value().clone());
        let counter = if cached.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        cached
    }

    pub fn insert(&self, key: SessionKey, entry: SessionEntry) -> SessionEntry {
        self.results.insert(key, entry.clone());
        entry
    }

    /// 命中时直接返回，否则计算后写入
    ///
    /// 计算在 map 锁之外进行，并发的同键调用可能各自计算一次，以后写入者为准。
    pub fn get_or_compute<E, F>(&self, key: SessionKey, compute: F) -> Result<SessionEntry, E>
    where
        F: FnOnce() -> Result<SessionEntry, E>,
    {
        if let Some(cached) = self.get(&key) {
            return Ok(cached);
        }
        Ok(self.insert(key, compute()?))
    }

    /// 使某条规则的所有缓存失效（包括单商品范围的），返回移除的条目数
    pub fn invalidate_rule(&self, rule_id: &str) -> usize {
        let mut removed = 0;
        self.results.retain(|key, _| {
            let keep = key.rule_id != rule_id;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// 使某个商品的单商品范围缓存失效
    pub fn invalidate_product(&self, product_id: ProductId) {
        self.results.retain(|key, _| key.scope != Some(product_id));
    }

    pub fn clear(&self) {
        self.results.clear();
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            entries: self.results.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
