//! 分类表（Theme / Subtheme / Group）读写
//!
//! 聚合核心只读取分类树；创建方法用于数据导入和测试播种。

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use tracing::{debug, info};

use super::{log_and_skip_err, placeholders};
use crate::database::QbankDatabase;
use crate::error::{QbankError, QbankResult};
use crate::models::{Group, ScopeKind, Subtheme, Theme};

/// Group 的上级链路
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLineage {
    pub subtheme_id: String,
    pub theme_id: String,
}

pub struct TaxonomyRepo;

impl TaxonomyRepo {
    // ========================================================================
    // 创建
    // ========================================================================

    pub fn create_theme(db: &QbankDatabase, theme: &Theme) -> QbankResult<()> {
        let conn = db.get_conn_safe()?;
        conn.execute(
            "INSERT INTO themes (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![theme.id, theme.name, theme.created_at],
        )?;
        info!("[Qbank::TaxonomyRepo] Created theme id={}", theme.id);
        Ok(())
    }

    pub fn create_subtheme(db: &QbankDatabase, subtheme: &Subtheme) -> QbankResult<()> {
        let conn = db.get_conn_safe()?;
        conn.execute(
            "INSERT INTO subthemes (id, theme_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                subtheme.id,
                subtheme.theme_id,
                subtheme.name,
                subtheme.created_at
            ],
        )?;
        info!(
            "[Qbank::TaxonomyRepo] Created subtheme id={} theme_id={}",
            subtheme.id, subtheme.theme_id
        );
        Ok(())
    }

    pub fn create_group(db: &QbankDatabase, group: &Group) -> QbankResult<()> {
        let conn = db.get_conn_safe()?;
        conn.execute(
            "INSERT INTO question_groups (id, subtheme_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![group.id, group.subtheme_id, group.name, group.created_at],
        )?;
        info!(
            "[Qbank::TaxonomyRepo] Created group id={} subtheme_id={}",
            group.id, group.subtheme_id
        );
        Ok(())
    }

    // ========================================================================
    // 查询
    // ========================================================================

    pub fn get_subtheme_with_conn(conn: &Connection, id: &str) -> QbankResult<Option<Subtheme>> {
        let subtheme = conn
            .query_row(
                "SELECT id, theme_id, name, created_at FROM subthemes WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Subtheme {
                        id: row.get(0)?,
                        theme_id: row.get(1)?,
                        name: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(subtheme)
    }

    pub fn get_group_with_conn(conn: &Connection, id: &str) -> QbankResult<Option<Group>> {
        let group = conn
            .query_row(
                "SELECT id, subtheme_id, name, created_at FROM question_groups WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Group {
                        id: row.get(0)?,
                        subtheme_id: row.get(1)?,
                        name: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(group)
    }

    pub fn theme_exists_with_conn(conn: &Connection, id: &str) -> QbankResult<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM themes WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// 某粒度下全部分类节点 id；全局粒度返回唯一的空命名空间
    pub fn list_ids(db: &QbankDatabase, kind: ScopeKind) -> QbankResult<Vec<String>> {
        let table = match kind {
            ScopeKind::Global => return Ok(vec![String::new()]),
            ScopeKind::Theme => "themes",
            ScopeKind::Subtheme => "subthemes",
            ScopeKind::Group => "question_groups",
        };
        let conn = db.get_conn_safe()?;
        let mut stmt = conn.prepare(&format!("SELECT id FROM {} ORDER BY id", table))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(log_and_skip_err).collect())
    }

    /// 批量解析 group → (subtheme, theme)
    ///
    /// 不存在的 group 不会出现在结果中。
    pub fn group_lineage(
        db: &QbankDatabase,
        group_ids: &[String],
    ) -> QbankResult<HashMap<String, GroupLineage>> {
        let conn = db.get_conn_safe()?;
        Self::group_lineage_with_conn(&conn, group_ids)
    }

    pub fn group_lineage_with_conn(
        conn: &Connection,
        group_ids: &[String],
    ) -> QbankResult<HashMap<String, GroupLineage>> {
        if group_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            r#"
            SELECT g.id, g.subtheme_id, s.theme_id
            FROM question_groups g
            JOIN subthemes s ON s.id = g.subtheme_id
            WHERE g.id IN ({})
            "#,
            placeholders(group_ids.len(), 1)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(group_ids.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                GroupLineage {
                    subtheme_id: row.get(1)?,
                    theme_id: row.get(2)?,
                },
            ))
        })?;
        let lineage: HashMap<String, GroupLineage> = rows.filter_map(log_and_skip_err).collect();

        debug!(
            "[Qbank::TaxonomyRepo] Resolved lineage for {}/{} groups",
            lineage.len(),
            group_ids.len()
        );
        Ok(lineage)
    }

    /// 批量解析 subtheme → theme
    pub fn subtheme_parents(
        db: &QbankDatabase,
        subtheme_ids: &[String],
    ) -> QbankResult<HashMap<String, String>> {
        let conn = db.get_conn_safe()?;
        Self::subtheme_parents_with_conn(&conn, subtheme_ids)
    }

    pub fn subtheme_parents_with_conn(
        conn: &Connection,
        subtheme_ids: &[String],
    ) -> QbankResult<HashMap<String, String>> {
        if subtheme_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            "SELECT id, theme_id FROM subthemes WHERE id IN ({})",
            placeholders(subtheme_ids.len(), 1)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(subtheme_ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.filter_map(log_and_skip_err).collect())
    }

    // ========================================================================
    // 校验
    // ========================================================================

    /// 校验题目的分类位置：
    /// - theme 必须存在
    /// - subtheme 存在时其父 theme 必须等于 theme_id
    /// - group 存在时必须同时有 subtheme，且 group 的父 subtheme 等于 subtheme_id
    pub fn validate_placement_with_conn(
        conn: &Connection,
        question_id: &str,
        theme_id: &str,
        subtheme_id: Option<&str>,
        group_id: Option<&str>,
    ) -> QbankResult<()> {
        let invalid = |reason: String| QbankError::InvalidTaxonomy {
            question_id: question_id.to_string(),
            reason,
        };

        if !Self::theme_exists_with_conn(conn, theme_id)? {
            return Err(invalid(format!("theme '{}' does not exist", theme_id)));
        }

        if let Some(subtheme_id) = subtheme_id {
            let subtheme = Self::get_subtheme_with_conn(conn, subtheme_id)?
                .ok_or_else(|| invalid(format!("subtheme '{}' does not exist", subtheme_id)))?;
            if subtheme.theme_id != theme_id {
                return Err(invalid(format!(
                    "subtheme '{}' belongs to theme '{}', not '{}'",
                    subtheme_id, subtheme.theme_id, theme_id
                )));
            }
        }

        if let Some(group_id) = group_id {
            let Some(subtheme_id) = subtheme_id else {
                return Err(invalid(format!(
                    "group '{}' requires a subtheme",
                    group_id
                )));
            };
            let group = Self::get_group_with_conn(conn, group_id)?
                .ok_or_else(|| invalid(format!("group '{}' does not exist", group_id)))?;
            if group.subtheme_id != subtheme_id {
                return Err(invalid(format!(
                    "group '{}' belongs to subtheme '{}', not '{}'",
                    group_id, group.subtheme_id, subtheme_id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn setup_test_db() -> (TempDir, QbankDatabase) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = QbankDatabase::new(temp_dir.path()).expect("Failed to create database");
        (temp_dir, db)
    }

    #[test]
    fn test_group_lineage() {
        let (_temp_dir, db) = setup_test_db();
        let theme = Theme::new("Trauma");
        let subtheme = Subtheme::new(&theme.id, "Fraturas");
        let group = Group::new(&subtheme.id, "Classificação");
        TaxonomyRepo::create_theme(&db, &theme).expect("theme");
        TaxonomyRepo::create_subtheme(&db, &subtheme).expect("subtheme");
        TaxonomyRepo::create_group(&db, &group).expect("group");

        let lineage = TaxonomyRepo::group_lineage(&db, &[group.id.clone(), "gr_unknown".into()])
            .expect("lineage");
        assert_eq!(lineage.len(), 1);
        assert_eq!(
            lineage[&group.id],
            GroupLineage {
                subtheme_id: subtheme.id.clone(),
                theme_id: theme.id.clone(),
            }
        );

        let parents = TaxonomyRepo::subtheme_parents(&db, &[subtheme.id.clone()]).expect("parents");
        assert_eq!(parents[&subtheme.id], theme.id);

        assert_eq!(
            TaxonomyRepo::list_ids(&db, ScopeKind::Group).expect("ids"),
            vec![group.id.clone()]
        );
        assert_eq!(
            TaxonomyRepo::list_ids(&db, ScopeKind::Global).expect("ids"),
            vec![String::new()]
        );
    }

    #[test]
    fn test_validate_placement() {
        let (_temp_dir, db) = setup_test_db();
        let trauma = Theme::new("Trauma");
        let cardio = Theme::new("Cardiologia");
        let fraturas = Subtheme::new(&trauma.id, "Fraturas");
        let classificacao = Group::new(&fraturas.id, "Classificação");
        TaxonomyRepo::create_theme(&db, &trauma).expect("theme");
        TaxonomyRepo::create_theme(&db, &cardio).expect("theme");
        TaxonomyRepo::create_subtheme(&db, &fraturas).expect("subtheme");
        TaxonomyRepo::create_group(&db, &classificacao).expect("group");

        let conn = db.get_conn_safe().expect("conn");
        TaxonomyRepo::validate_placement_with_conn(
            &conn,
            "q1",
            &trauma.id,
            Some(&fraturas.id),
            Some(&classificacao.id),
        )
        .expect("valid placement");

        let wrong_theme = TaxonomyRepo::validate_placement_with_conn(
            &conn,
            "q1",
            &cardio.id,
            Some(&fraturas.id),
            None,
        );
        assert_matches!(wrong_theme, Err(QbankError::InvalidTaxonomy { .. }));

        let orphan_group = TaxonomyRepo::validate_placement_with_conn(
            &conn,
            "q1",
            &trauma.id,
            None,
            Some(&classificacao.id),
        );
        assert_matches!(orphan_group, Err(QbankError::InvalidTaxonomy { .. }));
    }
}
