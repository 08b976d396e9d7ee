//! 分类作用域解析（覆盖优先级）
//!
//! 调用方同时选中的 theme / subtheme / group 可能相互重叠。解析规则：
//! - 选中 group 覆盖其父 subtheme 与祖父 theme
//! - 选中 subtheme 覆盖其父 theme
//! - 选中 subtheme 的部分子 group 被选中时，该 subtheme 成为“部分选中”，
//!   其余题目（补集）由抽题阶段单独补齐
//!
//! 父级查询（[`TaxonomyRepo`]）与覆盖计算（[`resolve_with_lineage`]）分离，后者是纯函数。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::database::QbankDatabase;
use crate::error::QbankResult;
use crate::models::ScopeSelection;
use crate::repos::{GroupLineage, TaxonomyRepo};

/// 解析后的有效作用域
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveScopes {
    /// 原始选择（模式过滤器按原始集合匹配）
    pub selection: ScopeSelection,
    /// 选中的 group（永远不会被覆盖）
    pub groups: BTreeSet<String>,
    /// 有效 subtheme：选中的 subtheme 去掉被选中 group 覆盖的
    pub subthemes: BTreeSet<String>,
    /// 有效 theme：选中的 theme 去掉被 group / subtheme 覆盖的
    pub themes: BTreeSet<String>,
    /// 部分选中的 subtheme → 其被选中的子 group
    pub partial_subthemes: BTreeMap<String, BTreeSet<String>>,
    /// 选中 group 的父 subtheme
    pub overridden_subthemes: BTreeSet<String>,
    /// 选中 group 的祖父 theme
    pub overridden_themes_by_group: BTreeSet<String>,
    /// 选中 subtheme 的父 theme
    pub overridden_themes_by_subtheme: BTreeSet<String>,
}

impl EffectiveScopes {
    /// 原始选择是否为空（走全局抽题快速路径）
    pub fn selection_is_empty(&self) -> bool {
        self.selection.is_empty()
    }
}

/// 覆盖计算
///
/// `group_lineage` 与 `subtheme_parents` 只需包含已知节点，缺失的 id 不参与覆盖。
pub fn resolve_with_lineage(
    selection: &ScopeSelection,
    group_lineage: &HashMap<String, GroupLineage>,
    subtheme_parents: &HashMap<String, String>,
) -> EffectiveScopes {
    let mut overridden_subthemes = BTreeSet::new();
    let mut overridden_themes_by_group = BTreeSet::new();
    let mut selected_children: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for group_id in &selection.groups {
        if let Some(lineage) = group_lineage.get(group_id) {
            overridden_subthemes.insert(lineage.subtheme_id.clone());
            overridden_themes_by_group.insert(lineage.theme_id.clone());
            selected_children
                .entry(lineage.subtheme_id.clone())
                .or_default()
                .insert(group_id.clone());
        }
    }

    let overridden_themes_by_subtheme: BTreeSet<String> = selection
        .subthemes
        .iter()
        .filter_map(|subtheme_id| subtheme_parents.get(subtheme_id).cloned())
        .collect();

    let subthemes = selection
        .subthemes
        .difference(&overridden_subthemes)
        .cloned()
        .collect();

    let themes = selection
        .themes
        .iter()
        .filter(|theme_id| {
            !overridden_themes_by_group.contains(*theme_id)
                && !overridden_themes_by_subtheme.contains(*theme_id)
        })
        .cloned()
        .collect();

    let partial_subthemes = selected_children
        .into_iter()
        .filter(|(subtheme_id, _)| selection.subthemes.contains(subtheme_id))
        .collect();

    EffectiveScopes {
        selection: selection.clone(),
        groups: selection.groups.clone(),
        subthemes,
        themes,
        partial_subthemes,
        overridden_subthemes,
        overridden_themes_by_group,
        overridden_themes_by_subtheme,
    }
}

pub struct ScopeResolver;

impl ScopeResolver {
    /// 查询父级关系并计算有效作用域
    pub fn resolve(db: &QbankDatabase, selection: &ScopeSelection) -> QbankResult<EffectiveScopes> {
        if selection.is_empty() {
            return Ok(EffectiveScopes::default());
        }

        let group_ids: Vec<String> = selection.groups.iter().cloned().collect();
        let subtheme_ids: Vec<String> = selection.subthemes.iter().cloned().collect();
        let lineage = TaxonomyRepo::group_lineage(db, &group_ids)?;
        let parents = TaxonomyRepo::subtheme_parents(db, &subtheme_ids)?;

        for unknown in group_ids.iter().filter(|id| !lineage.contains_key(*id)) {
            warn!(
                "[Qbank::ScopeResolver] Unknown group '{}' ignored for override resolution",
                unknown
            );
        }
        for unknown in subtheme_ids.iter().filter(|id| !parents.contains_key(*id)) {
            warn!(
                "[Qbank::ScopeResolver] Unknown subtheme '{}' ignored for override resolution",
                unknown
            );
        }

        let effective = resolve_with_lineage(selection, &lineage, &parents);
        debug!(
            "[Qbank::ScopeResolver] groups={} subthemes={} (partial={}) themes={}",
            effective.groups.len(),
            effective.subthemes.len(),
            effective.partial_subthemes.len(),
            effective.themes.len()
        );
        Ok(effective)
    }
}
