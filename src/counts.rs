//! 按作用域计数（直接读计数索引，不扫描主表）

use futures::future::try_join_all;
use tracing::debug;

use crate::aggregates::{AggregateSet, Bounds};
use crate::error::QbankResult;
use crate::models::Scope;
use crate::scope_resolver::EffectiveScopes;

pub struct AggregateCounts {
    indexes: AggregateSet,
}

impl AggregateCounts {
    pub fn new(indexes: AggregateSet) -> Self {
        Self { indexes }
    }

    /// 作用域内的题目数
    pub async fn count(&self, scope: &Scope) -> QbankResult<u64> {
        self.count_in_range(scope, &Bounds::unbounded()).await
    }

    /// 作用域内、排序键落在 `bounds` 内的题目数
    pub async fn count_in_range(&self, scope: &Scope, bounds: &Bounds) -> QbankResult<u64> {
        let count = self
            .indexes
            .counter(scope.kind())
            .count(scope.namespace(), bounds)
            .await?;
        Ok(count)
    }

    /// 估算选择范围的可用题目数（与随机抽题使用相同的有效作用域）
    ///
    /// 部分选中的 subtheme 计为 subtheme 总数减去已选子 group 的数量。
    pub async fn count_available(&self, effective: &EffectiveScopes) -> QbankResult<u64> {
        if effective.selection_is_empty() {
            return self.count(&Scope::Global).await;
        }

        let scopes: Vec<Scope> = effective
            .groups
            .iter()
            .cloned()
            .map(Scope::Group)
            .chain(effective.subthemes.iter().cloned().map(Scope::Subtheme))
            .chain(effective.themes.iter().cloned().map(Scope::Theme))
            .collect();
        let direct: u64 = try_join_all(scopes.iter().map(|scope| self.count(scope)))
            .await?
            .into_iter()
            .sum();

        let mut complement = 0u64;
        for (subtheme_id, groups) in &effective.partial_subthemes {
            let whole = self.count(&Scope::Subtheme(subtheme_id.clone())).await?;
            let group_scopes: Vec<Scope> = groups.iter().cloned().map(Scope::Group).collect();
            let grouped: u64 = try_join_all(group_scopes.iter().map(|scope| self.count(scope)))
                .await?
                .into_iter()
                .sum();
            complement += whole.saturating_sub(grouped);
        }

        debug!(
            "[Qbank::Counts] direct={} complement={} across {} scope(s)",
            direct,
            complement,
            scopes.len() + effective.partial_subthemes.len()
        );
        Ok(direct + complement)
    }
}
