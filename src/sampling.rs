//! 随机抽题组装（模式 `all`）
//!
//! 每个有效作用域单独向对应的随机索引抽取至多 `target` 个题目，
//! 合并、去重后用 Fisher–Yates 洗牌截断到 `target`。
//!
//! 部分选中的 subtheme 不走 random-by-subtheme（会与已选 group 重复计数），
//! 而是直接扫描主表取补集：`group_id` 为空或不在已选 group 中的题目。

use futures::future::{join_all, BoxFuture, FutureExt};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::aggregates::{AggregateIndex, AggregateSet};
use crate::database::QbankDatabase;
use crate::error::QbankError;
use crate::models::{Scope, ScopeKind};
use crate::repos::QuestionRepo;
use crate::scope_resolver::EffectiveScopes;

pub struct RandomSamplingAssembler {
    db: Arc<QbankDatabase>,
    indexes: AggregateSet,
}

impl RandomSamplingAssembler {
    pub fn new(db: Arc<QbankDatabase>, indexes: AggregateSet) -> Self {
        Self { db, indexes }
    }

    /// 按有效作用域抽题，返回至多 `target` 个互不相同的题目 ID
    ///
    /// 单个作用域抽取失败只记录日志，该作用域不贡献题目。
    pub async fn assemble(&self, effective: &EffectiveScopes, target: usize) -> Vec<String> {
        if target == 0 {
            return Vec::new();
        }

        if effective.selection_is_empty() {
            return draw(
                Arc::clone(self.indexes.sampler(ScopeKind::Global)),
                Scope::Global,
                target,
            )
            .await;
        }

        let mut tasks: Vec<BoxFuture<'static, Vec<String>>> = Vec::new();

        for group_id in &effective.groups {
            tasks.push(
                draw(
                    Arc::clone(self.indexes.sampler(ScopeKind::Group)),
                    Scope::Group(group_id.clone()),
                    target,
                )
                .boxed(),
            );
        }

        for (subtheme_id, selected_groups) in &effective.partial_subthemes {
            tasks.push(
                complement(
                    Arc::clone(&self.db),
                    subtheme_id.clone(),
                    selected_groups.clone(),
                )
                .boxed(),
            );
        }

        for subtheme_id in &effective.subthemes {
            tasks.push(
                draw(
                    Arc::clone(self.indexes.sampler(ScopeKind::Subtheme)),
                    Scope::Subtheme(subtheme_id.clone()),
                    target,
                )
                .boxed(),
            );
        }

        for theme_id in &effective.themes {
            tasks.push(
                draw(
                    Arc::clone(self.indexes.sampler(ScopeKind::Theme)),
                    Scope::Theme(theme_id.clone()),
                    target,
                )
                .boxed(),
            );
        }

        let draws = tasks.len();
        let ids: Vec<String> = join_all(tasks).await.into_iter().flatten().collect();
        let drawn = ids.len();
        let result = finalize_ids(ids, target, &mut rand::thread_rng());

        debug!(
            "[Qbank::Sampling] {} draw(s) yielded {} id(s), returning {} (target {})",
            draws,
            drawn,
            result.len(),
            target
        );
        result
    }
}

/// 去重（保留首次出现的顺序），超过 `target` 时洗牌并截断
pub fn finalize_ids<R: Rng + ?Sized>(ids: Vec<String>, target: usize, rng: &mut R) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    let mut unique: Vec<String> = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();

    if unique.len() > target {
        unique.shuffle(rng);
        unique.truncate(target);
    }
    unique
}

async fn draw(index: Arc<dyn AggregateIndex>, scope: Scope, target: usize) -> Vec<String> {
    match index.random_sample(scope.namespace(), target).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(
                index = %index.id(),
                scope = ?scope,
                error = %e,
                "[Qbank::Sampling] Random draw failed, scope contributes nothing"
            );
            Vec::new()
        }
    }
}

async fn complement(
    db: Arc<QbankDatabase>,
    subtheme_id: String,
    selected_groups: BTreeSet<String>,
) -> Vec<String> {
    let scope = Scope::Subtheme(subtheme_id);
    let scan_scope = scope.clone();
    let scanned = tokio::task::spawn_blocking(move || QuestionRepo::list_by_scope(&db, &scan_scope))
        .await
        .map_err(|e| QbankError::Other(format!("blocking task failed: {}", e)))
        .and_then(|result| result);

    match scanned {
        Ok(questions) => questions
            .into_iter()
            .filter(|q| {
                q.group_id
                    .as_ref()
                    .map_or(true, |group_id| !selected_groups.contains(group_id))
            })
            .map(|q| q.id)
            .collect(),
        Err(e) => {
            warn!(
                scope = ?scope,
                error = %e,
                "[Qbank::Sampling] Complement scan failed, scope contributes nothing"
            );
            Vec::new()
        }
    }
}
