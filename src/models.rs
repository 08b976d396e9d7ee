//! 题库领域模型
//!
//! 题目、三级分类（Theme → Subtheme → Group）以及作用域（Scope）的类型定义。
//! 聚合索引按 [`ScopeKind`] 分派，不再对可选字段做临时探测。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// 分类节点
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subtheme {
    pub id: String,
    pub theme_id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub subtheme_id: String,
    pub name: String,
    pub created_at: String,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Theme {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("th_{}", nanoid::nanoid!(10)),
            name: name.into(),
            created_at: now_rfc3339(),
        }
    }
}

impl Subtheme {
    pub fn new(theme_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: format!("st_{}", nanoid::nanoid!(10)),
            theme_id: theme_id.into(),
            name: name.into(),
            created_at: now_rfc3339(),
        }
    }
}

impl Group {
    pub fn new(subtheme_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: format!("gr_{}", nanoid::nanoid!(10)),
            subtheme_id: subtheme_id.into(),
            name: name.into(),
            created_at: now_rfc3339(),
        }
    }
}

// ============================================================================
// 题目
// ============================================================================

/// 题目实体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub title: String,
    pub question_text: String,
    pub explanation: Option<String>,
    pub theme_id: String,
    pub subtheme_id: Option<String>,
    pub group_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Question {
    /// 题目所属的全部作用域（全局总是包含在内）
    pub fn scopes(&self) -> Vec<Scope> {
        ScopeKind::ALL
            .iter()
            .filter_map(|kind| kind.scope_of(self))
            .collect()
    }
}

/// 题目创建参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuestionParams {
    pub title: String,
    pub question_text: String,
    pub explanation: Option<String>,
    pub theme_id: String,
    pub subtheme_id: Option<String>,
    pub group_id: Option<String>,
}

/// 题目更新补丁（增量更新）
///
/// 可清空的字段使用 `Option<Option<_>>`：外层 `None` 表示不修改，`Some(None)` 表示清空。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuestionPatch {
    pub title: Option<String>,
    pub question_text: Option<String>,
    pub explanation: Option<Option<String>>,
    pub theme_id: Option<String>,
    pub subtheme_id: Option<Option<String>>,
    pub group_id: Option<Option<String>>,
}

/// 补丁相对旧题目实际改变了哪些分类字段
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaxonomyChanges {
    pub theme: bool,
    pub subtheme: bool,
    pub group: bool,
}

impl TaxonomyChanges {
    pub fn any(&self) -> bool {
        self.theme || self.subtheme || self.group
    }
}

impl QuestionPatch {
    /// 将补丁应用到题目，返回新值（不修改 id / created_at / updated_at）
    pub fn apply_to(&self, question: &Question) -> Question {
        let mut next = question.clone();
        if let Some(title) = &self.title {
            next.title = title.clone();
        }
        if let Some(text) = &self.question_text {
            next.question_text = text.clone();
        }
        if let Some(explanation) = &self.explanation {
            next.explanation = explanation.clone();
        }
        if let Some(theme_id) = &self.theme_id {
            next.theme_id = theme_id.clone();
        }
        if let Some(subtheme_id) = &self.subtheme_id {
            next.subtheme_id = subtheme_id.clone();
        }
        if let Some(group_id) = &self.group_id {
            next.group_id = group_id.clone();
        }
        next
    }

    pub fn taxonomy_changes(&self, old: &Question) -> TaxonomyChanges {
        TaxonomyChanges {
            theme: self
                .theme_id
                .as_ref()
                .is_some_and(|theme_id| *theme_id != old.theme_id),
            subtheme: self
                .subtheme_id
                .as_ref()
                .is_some_and(|subtheme_id| *subtheme_id != old.subtheme_id),
            group: self
                .group_id
                .as_ref()
                .is_some_and(|group_id| *group_id != old.group_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == QuestionPatch::default()
    }
}

// ============================================================================
// 作用域
// ============================================================================

/// 作用域粒度（聚合索引的分派依据）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Global,
    Theme,
    Subtheme,
    Group,
}

impl ScopeKind {
    pub const ALL: [ScopeKind; 4] = [
        ScopeKind::Global,
        ScopeKind::Theme,
        ScopeKind::Subtheme,
        ScopeKind::Group,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Global => "global",
            ScopeKind::Theme => "theme",
            ScopeKind::Subtheme => "subtheme",
            ScopeKind::Group => "group",
        }
    }

    /// 题目在该粒度下所属的作用域；题目缺少该粒度的分类字段时返回 None
    pub fn scope_of(&self, question: &Question) -> Option<Scope> {
        match self {
            ScopeKind::Global => Some(Scope::Global),
            ScopeKind::Theme => Some(Scope::Theme(question.theme_id.clone())),
            ScopeKind::Subtheme => question.subtheme_id.clone().map(Scope::Subtheme),
            ScopeKind::Group => question.group_id.clone().map(Scope::Group),
        }
    }
}

/// 具体作用域：全局，或某个分类节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Global,
    Theme(String),
    Subtheme(String),
    Group(String),
}

impl Scope {
    pub fn kind(&self) -> ScopeKind {
        match self {
            Scope::Global => ScopeKind::Global,
            Scope::Theme(_) => ScopeKind::Theme,
            Scope::Subtheme(_) => ScopeKind::Subtheme,
            Scope::Group(_) => ScopeKind::Group,
        }
    }

    /// 聚合索引中的命名空间；全局作用域使用空字符串
    pub fn namespace(&self) -> &str {
        match self {
            Scope::Global => "",
            Scope::Theme(id) | Scope::Subtheme(id) | Scope::Group(id) => id,
        }
    }
}

/// 调用方提交的分类选择（请求级临时值）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSelection {
    #[serde(default)]
    pub themes: BTreeSet<String>,
    #[serde(default)]
    pub subthemes: BTreeSet<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl ScopeSelection {
    pub fn new<I, J, K>(themes: I, subthemes: J, groups: K) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        J: IntoIterator,
        J::Item: Into<String>,
        K: IntoIterator,
        K::Item: Into<String>,
    {
        Self {
            themes: themes.into_iter().map(Into::into).collect(),
            subthemes: subthemes.into_iter().map(Into::into).collect(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.themes.is_empty() && self.subthemes.is_empty() && self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question() -> Question {
        Question {
            id: "q1".to_string(),
            title: "Fratura de Colles".to_string(),
            question_text: "Qual o desvio típico?".to_string(),
            explanation: None,
            theme_id: "t1".to_string(),
            subtheme_id: Some("s1".to_string()),
            group_id: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_scopes_follow_present_fields() {
        let q = question();
        assert_eq!(
            q.scopes(),
            vec![
                Scope::Global,
                Scope::Theme("t1".to_string()),
                Scope::Subtheme("s1".to_string()),
            ]
        );
        assert_eq!(ScopeKind::Group.scope_of(&q), None);
    }

    #[test]
    fn test_patch_detects_only_real_changes() {
        let q = question();
        let patch = QuestionPatch {
            title: Some("Novo título".to_string()),
            theme_id: Some("t1".to_string()),
            subtheme_id: Some(None),
            ..Default::default()
        };
        let changes = patch.taxonomy_changes(&q);
        assert!(!changes.theme);
        assert!(changes.subtheme);
        assert!(!changes.group);

        let next = patch.apply_to(&q);
        assert_eq!(next.title, "Novo título");
        assert_eq!(next.subtheme_id, None);
        assert_eq!(next.theme_id, "t1");
    }

    #[test]
    fn test_content_only_patch_has_no_taxonomy_change() {
        let patch = QuestionPatch {
            explanation: Some(Some("Desvio dorsal".to_string())),
            ..Default::default()
        };
        assert!(!patch.taxonomy_changes(&question()).any());
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_scope_namespace() {
        assert_eq!(Scope::Global.namespace(), "");
        assert_eq!(Scope::Group("g1".to_string()).namespace(), "g1");
        assert_eq!(Scope::Subtheme("s1".to_string()).kind(), ScopeKind::Subtheme);
    }
}
