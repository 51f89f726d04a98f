//! 规则存储管理
//!
//! 使用 DashMap 提供线程安全的规则仓库，按目标建立索引，
//! 支持规则的加载、更新、删除和批量操作。

use crate::error::{Result, RuleError};
use crate::models::{Rule, TargetRef};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// 按目标提供启用规则
pub trait RuleProvider: Send + Sync {
    /// 目标下所有启用的规则，按规则 ID 排序
    fn active_rules_for(&self, target: &TargetRef) -> Vec<Rule>;

    /// 所有挂有规则的目标
    fn targets(&self) -> Vec<TargetRef>;
}

/// 规则存储
#[derive(Clone, Default)]
pub struct RuleStore {
    rules: Arc<DashMap<String, Rule>>,
    /// 目标 -> 规则 ID
    by_target: Arc<DashMap<TargetRef, BTreeSet<String>>>,
}

impl RuleStore {
    /// 创建新的规则存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取当前存储的规则数量
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// 检查存储是否为空
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 加载规则，同 ID 的规则会被替换
    #[instrument(skip(self, rule), fields(rule_id = %rule.id, rule_name = %rule.name))]
    pub fn load(&self, rule: Rule) -> Result<()> {
        Self::validate(&rule)?;

        let rule_id = rule.id.clone();
        let target = rule.target;
        if let Some(previous) = self.rules.insert(rule_id.clone(), rule) {
            if previous.target != target {
                self.unindex(&previous.target, &rule_id);
            }
        }
        self.by_target
            .entry(target)
            .or_default()
            .insert(rule_id.clone());

        info!("规则已加载: {}", rule_id);
        Ok(())
    }

    /// 加载规则（从 JSON 字符串）
    ///
    /// 规则树损坏时按空树加载，不会失败。
    #[instrument(skip(self, json))]
    pub fn load_from_json(&self, json: &str) -> Result<String> {
        let rule: Rule = serde_json::from_str(json)?;
        let rule_id = rule.id.clone();
        self.load(rule)?;
        Ok(rule_id)
    }

    /// 更新规则
    #[instrument(skip(self, rule), fields(rule_id = %rule.id))]
    pub fn update(&self, mut rule: Rule) -> Result<()> {
        let rule_id = rule.id.clone();

        if !self.rules.contains_key(&rule_id) {
            warn!("更新不存在的规则: {}", rule_id);
            return Err(RuleError::RuleNotFound(rule_id));
        }

        rule.updated_at = chrono::Utc::now();
        self.load(rule)
    }

    /// 删除规则
    #[instrument(skip(self))]
    pub fn delete(&self, rule_id: &str) -> Result<Rule> {
        match self.rules.remove(rule_id) {
            Some((_, rule)) => {
                self.unindex(&rule.target, rule_id);
                info!("规则已删除: {}", rule_id);
                Ok(rule)
            }
            None => {
                warn!("删除不存在的规则: {}", rule_id);
                Err(RuleError::RuleNotFound(rule_id.to_string()))
            }
        }
    }

    /// 获取规则
    pub fn get(&self, rule_id: &str) -> Option<Rule> {
        self.rules.get(rule_id).map(|r| r.clone())
    }

    /// 检查规则是否存在
    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.contains_key(rule_id)
    }

    /// 获取所有规则 ID
    pub fn list_ids(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.key().clone()).collect()
    }

    /// 获取目标下的所有规则（包括停用的）
    pub fn rules_for(&self, target: &TargetRef) -> Vec<Rule> {
        let ids = match self.by_target.get(target) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// 批量加载规则
    #[instrument(skip(self, rules))]
    pub fn load_batch(&self, rules: Vec<Rule>) -> Result<Vec<String>> {
        let mut loaded_ids = Vec::with_capacity(rules.len());
        let mut errors = Vec::new();

        for rule in rules {
            let rule_id = rule.id.clone();
            match self.load(rule) {
                Ok(()) => loaded_ids.push(rule_id),
                Err(e) => errors.push((rule_id, e)),
            }
        }

        if !errors.is_empty() {
            warn!("批量加载部分失败: {:?}", errors);
        }

        info!("批量加载完成: {} 成功, {} 失败", loaded_ids.len(), errors.len());
        Ok(loaded_ids)
    }

    /// 清空所有规则
    #[instrument(skip(self))]
    pub fn clear(&self) {
        let count = self.rules.len();
        self.rules.clear();
        self.by_target.clear();
        info!("已清空 {} 条规则", count);
    }

    /// 获取规则统计信息
    pub fn stats(&self) -> RuleStoreStats {
        let rules_count = self.rules.len();
        let active_rules = self.rules.iter().filter(|r| r.is_active).count();
        let total_conditions: usize = self
            .rules
            .iter()
            .map(|r| r.root.condition_count())
            .sum();

        RuleStoreStats {
            rules_count,
            active_rules,
            targets: self.by_target.len(),
            total_conditions,
            avg_conditions_per_rule: if rules_count > 0 {
                total_conditions as f64 / rules_count as f64
            } else {
                0.0
            },
        }
    }

    fn validate(rule: &Rule) -> Result<()> {
        if rule.id.is_empty() {
            return Err(RuleError::ParseError("规则 ID 不能为空".to_string()));
        }

        if rule.name.is_empty() {
            return Err(RuleError::ParseError("规则名称不能为空".to_string()));
        }

        let mut empty_attribute = None;
        rule.root.for_each_condition(|path, cond| {
            if empty_attribute.is_none() && cond.attribute.trim().is_empty() {
                empty_attribute = Some(path.to_string());
            }
        });
        if let Some(path) = empty_attribute {
            return Err(RuleError::MalformedTree(format!(
                "条件 '{}' 的属性不能为空",
                path
            )));
        }

        Ok(())
    }

    fn unindex(&self, target: &TargetRef, rule_id: &str) {
        let now_empty = match self.by_target.get_mut(target) {
            Some(mut ids) => {
                ids.remove(rule_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_target.remove_if(target, |_, ids| ids.is_empty());
        }
    }
}

impl RuleProvider for RuleStore {
    fn active_rules_for(&self, target: &TargetRef) -> Vec<Rule> {
        self.rules_for(target)
            .into_iter()
            .filter(|rule| rule.is_active)
            .collect()
    }

    fn targets(&self) -> Vec<TargetRef> {
        let mut targets: Vec<TargetRef> = self.by_target.iter().map(|e| *e.key()).collect();
        targets.sort();
        targets
    }
}

/// 规则存储统计信息
#[derive(Debug, Clone)]
pub struct RuleStoreStats {
    /// 规则总数
    pub rules_count: usize,
    /// 启用的规则数
    pub active_rules: usize,
    /// 挂有规则的目标数
    pub targets: usize,
    /// 所有规则的条件节点总数
    pub total_conditions: usize,
    /// 平均每条规则的条件数
    pub avg_conditions_per_rule: f64,
}
