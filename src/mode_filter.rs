//! 按用户状态筛选的候选题池（unanswered / incorrect / bookmarked）
//!
//! 候选集来自用户二级索引，随后在内存中按与抽题相同的覆盖优先级过滤：
//! group 命中优先，其次 subtheme，最后 theme；每道题至多保留一次。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::database::QbankDatabase;
use crate::error::{QbankError, QbankResult};
use crate::models::Question;
use crate::repos::UserRepo;
use crate::scope_resolver::EffectiveScopes;

/// 组卷模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuizMode {
    /// 不按用户状态筛选，走聚合索引随机抽题
    All,
    Unanswered,
    Incorrect,
    Bookmarked,
}

impl QuizMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuizMode::All => "all",
            QuizMode::Unanswered => "unanswered",
            QuizMode::Incorrect => "incorrect",
            QuizMode::Bookmarked => "bookmarked",
        }
    }

    /// 是否需要用户候选集
    pub fn is_user_filtered(&self) -> bool {
        !matches!(self, QuizMode::All)
    }
}

impl fmt::Display for QuizMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuizMode {
    type Err = QbankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(QuizMode::All),
            "unanswered" => Ok(QuizMode::Unanswered),
            "incorrect" => Ok(QuizMode::Incorrect),
            "bookmarked" => Ok(QuizMode::Bookmarked),
            other => Err(QbankError::InvalidMode(other.to_string())),
        }
    }
}

pub struct ModeFilteredPoolResolver;

impl ModeFilteredPoolResolver {
    /// 取用户候选集并按作用域过滤
    ///
    /// 未选择任何分类时直接返回候选集，由调用方洗牌截断。
    pub fn resolve(
        db: &QbankDatabase,
        user_id: &str,
        mode: QuizMode,
        effective: &EffectiveScopes,
    ) -> QbankResult<Vec<Question>> {
        let candidates = match mode {
            QuizMode::Incorrect => UserRepo::incorrect_questions(db, user_id)?,
            QuizMode::Unanswered => UserRepo::unanswered_questions(db, user_id)?,
            QuizMode::Bookmarked => UserRepo::bookmarked_questions(db, user_id)?,
            QuizMode::All => {
                return Err(QbankError::InvalidMode(format!(
                    "'{}' is served by random sampling, not the user pool",
                    mode
                )))
            }
        };

        if effective.selection_is_empty() {
            debug!(
                "[Qbank::ModeFilter] mode={} user={} candidates={} (no taxonomy filter)",
                mode,
                user_id,
                candidates.len()
            );
            return Ok(candidates);
        }

        let total = candidates.len();
        let retained = retain_by_precedence(candidates, effective);
        debug!(
            "[Qbank::ModeFilter] mode={} user={} retained {}/{}",
            mode,
            user_id,
            retained.len(),
            total
        );
        Ok(retained)
    }
}

/// 内存中的三级覆盖过滤
///
/// - (a) `group_id` 在已选 group 中
/// - (b) `subtheme_id` 在已选 subtheme 中，且该 subtheme 未被已选 group 覆盖或题目没有 group
/// - (c) `theme_id` 在已选 theme 中，且该 theme 未被已选 subtheme 覆盖
pub fn retain_by_precedence(candidates: Vec<Question>, effective: &EffectiveScopes) -> Vec<Question> {
    let selection = &effective.selection;
    let mut seen = HashSet::new();

    candidates
        .into_iter()
        .filter(|q| {
            let by_group = q
                .group_id
                .as_ref()
                .is_some_and(|g| selection.groups.contains(g));
            let by_subtheme = || {
                q.subtheme_id.as_ref().is_some_and(|s| {
                    selection.subthemes.contains(s)
                        && (!effective.overridden_subthemes.contains(s) || q.group_id.is_none())
                })
            };
            let by_theme = || {
                selection.themes.contains(&q.theme_id)
                    && !effective.overridden_themes_by_subtheme.contains(&q.theme_id)
            };
            by_group || by_subtheme() || by_theme()
        })
        .filter(|q| seen.insert(q.id.clone()))
        .collect()
}
