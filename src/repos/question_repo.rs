//! 题目主表 CRUD 操作
//!
//! 题目主表是唯一的事实来源，聚合索引只是可重建的缓存层。
//!
//! ## 核心方法
//! - `create_question`: 创建题目（校验分类位置）
//! - `update_question`: 应用增量补丁
//! - `delete_question`: 硬删除题目
//! - `list_by_scope` / `count_by_scope`: 按作用域扫描，供补集抽题和对账使用

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use tracing::{debug, info};

use super::taxonomy_repo::TaxonomyRepo;
use super::{log_and_skip_err, placeholders};
use crate::database::QbankDatabase;
use crate::error::{QbankError, QbankResult};
use crate::models::{CreateQuestionParams, Question, QuestionPatch, Scope, ScopeKind};

const QUESTION_COLUMNS: &str = "id, title, question_text, explanation, theme_id, subtheme_id, group_id, created_at, updated_at";

pub struct QuestionRepo;

impl QuestionRepo {
    // ========================================================================
    // 写入
    // ========================================================================

    /// 创建题目
    pub fn create_question(
        db: &QbankDatabase,
        params: &CreateQuestionParams,
    ) -> QbankResult<Question> {
        let conn = db.get_conn_safe()?;
        Self::create_question_with_conn(&conn, params)
    }

    /// 创建题目（使用现有连接）
    pub fn create_question_with_conn(
        conn: &Connection,
        params: &CreateQuestionParams,
    ) -> QbankResult<Question> {
        let id = format!("q_{}", nanoid::nanoid!(10));
        let now = chrono::Utc::now().to_rfc3339();

        if params.title.trim().is_empty() {
            return Err(QbankError::InvalidArgument {
                param: "title".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        TaxonomyRepo::validate_placement_with_conn(
            conn,
            &id,
            &params.theme_id,
            params.subtheme_id.as_deref(),
            params.group_id.as_deref(),
        )?;

        conn.execute(
            r#"
            INSERT INTO questions (
                id, title, question_text, explanation, theme_id, subtheme_id, group_id,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                id,
                params.title,
                params.question_text,
                params.explanation,
                params.theme_id,
                params.subtheme_id,
                params.group_id,
                now,
                now,
            ],
        )?;

        info!("[Qbank::QuestionRepo] Created question id={}", id);

        Self::get_question_with_conn(conn, &id)?
            .ok_or_else(|| QbankError::not_found("question", id.clone()))
    }

    /// 应用增量补丁，返回更新后的题目
    ///
    /// 题目不存在时返回 `NotFound`；补丁后的分类位置不合法时返回 `InvalidTaxonomy`。
    pub fn update_question(
        db: &QbankDatabase,
        question_id: &str,
        patch: &QuestionPatch,
    ) -> QbankResult<Question> {
        let conn = db.get_conn_safe()?;
        Self::update_question_with_conn(&conn, question_id, patch)
    }

    pub fn update_question_with_conn(
        conn: &Connection,
        question_id: &str,
        patch: &QuestionPatch,
    ) -> QbankResult<Question> {
        let current = Self::get_question_with_conn(conn, question_id)?
            .ok_or_else(|| QbankError::not_found("question", question_id))?;

        if patch.is_empty() {
            return Ok(current);
        }

        let next = patch.apply_to(&current);
        if patch.taxonomy_changes(&current).any() {
            TaxonomyRepo::validate_placement_with_conn(
                conn,
                question_id,
                &next.theme_id,
                next.subtheme_id.as_deref(),
                next.group_id.as_deref(),
            )?;
        }

        let now = chrono::Utc::now().to_rfc3339();
        let affected = conn.execute(
            r#"
            UPDATE questions
            SET title = ?1, question_text = ?2, explanation = ?3,
                theme_id = ?4, subtheme_id = ?5, group_id = ?6, updated_at = ?7
            WHERE id = ?8
            "#,
            params![
                next.title,
                next.question_text,
                next.explanation,
                next.theme_id,
                next.subtheme_id,
                next.group_id,
                now,
                question_id,
            ],
        )?;

        if affected == 0 {
            return Err(QbankError::not_found("question", question_id));
        }

        debug!("[Qbank::QuestionRepo] Updated question id={}", question_id);

        Self::get_question_with_conn(conn, question_id)?
            .ok_or_else(|| QbankError::not_found("question", question_id))
    }

    /// 硬删除题目，返回主表行是否被删除
    pub fn delete_question(db: &QbankDatabase, question_id: &str) -> QbankResult<bool> {
        let conn = db.get_conn_safe()?;
        Self::delete_question_with_conn(&conn, question_id)
    }

    pub fn delete_question_with_conn(conn: &Connection, question_id: &str) -> QbankResult<bool> {
        let affected = conn.execute("DELETE FROM questions WHERE id = ?1", params![question_id])?;
        if affected > 0 {
            info!("[Qbank::QuestionRepo] Deleted question id={}", question_id);
        }
        Ok(affected > 0)
    }

    // ========================================================================
    // 查询
    // ========================================================================

    pub fn get_question(db: &QbankDatabase, question_id: &str) -> QbankResult<Option<Question>> {
        let conn = db.get_conn_safe()?;
        Self::get_question_with_conn(&conn, question_id)
    }

    pub fn get_question_with_conn(
        conn: &Connection,
        question_id: &str,
    ) -> QbankResult<Option<Question>> {
        let sql = format!("SELECT {} FROM questions WHERE id = ?1", QUESTION_COLUMNS);
        let question = conn
            .query_row(&sql, params![question_id], Self::row_to_question)
            .optional()?;
        Ok(question)
    }

    /// 按 ID 批量获取题目，结果顺序与输入一致，不存在的 ID 被跳过
    pub fn get_questions_by_ids(
        db: &QbankDatabase,
        question_ids: &[String],
    ) -> QbankResult<Vec<Question>> {
        let conn = db.get_conn_safe()?;
        Self::get_questions_by_ids_with_conn(&conn, question_ids)
    }

    pub fn get_questions_by_ids_with_conn(
        conn: &Connection,
        question_ids: &[String],
    ) -> QbankResult<Vec<Question>> {
        if question_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_id: HashMap<String, Question> = HashMap::with_capacity(question_ids.len());
        // SQLite 默认变量上限 999，分批查询
        for chunk in question_ids.chunks(500) {
            let sql = format!(
                "SELECT {} FROM questions WHERE id IN ({})",
                QUESTION_COLUMNS,
                placeholders(chunk.len(), 1)
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows =
                stmt.query_map(rusqlite::params_from_iter(chunk.iter()), Self::row_to_question)?;
            for question in rows.filter_map(log_and_skip_err) {
                by_id.insert(question.id.clone(), question);
            }
        }

        Ok(question_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect())
    }

    /// 列出某作用域内的全部题目（直接扫描主表）
    pub fn list_by_scope(db: &QbankDatabase, scope: &Scope) -> QbankResult<Vec<Question>> {
        let conn = db.get_conn_safe()?;
        Self::list_by_scope_with_conn(&conn, scope)
    }

    pub fn list_by_scope_with_conn(conn: &Connection, scope: &Scope) -> QbankResult<Vec<Question>> {
        let (filter, namespace) = Self::scope_filter(scope);
        let sql = format!(
            "SELECT {} FROM questions {} ORDER BY id",
            QUESTION_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = match namespace {
            Some(ns) => stmt.query_map(params![ns], Self::row_to_question)?,
            None => stmt.query_map([], Self::row_to_question)?,
        };
        let questions: Vec<Question> = rows.filter_map(log_and_skip_err).collect();

        debug!(
            "[Qbank::QuestionRepo] Scanned {} questions for scope {:?}",
            questions.len(),
            scope
        );
        Ok(questions)
    }

    /// 统计某作用域内的题目数（主表精确值）
    pub fn count_by_scope(db: &QbankDatabase, scope: &Scope) -> QbankResult<u64> {
        let conn = db.get_conn_safe()?;
        let (filter, namespace) = Self::scope_filter(scope);
        let sql = format!("SELECT COUNT(*) FROM questions {}", filter);
        let count: i64 = match namespace {
            Some(ns) => conn.query_row(&sql, params![ns], |row| row.get(0))?,
            None => conn.query_row(&sql, [], |row| row.get(0))?,
        };
        Ok(count.max(0) as u64)
    }

    /// 按粒度分组统计主表题目数：命名空间 → 数量（全局粒度的命名空间为空字符串）
    pub fn count_grouped_by(
        db: &QbankDatabase,
        kind: ScopeKind,
    ) -> QbankResult<HashMap<String, u64>> {
        let conn = db.get_conn_safe()?;
        let column = match kind {
            ScopeKind::Global => {
                let total: i64 =
                    conn.query_row("SELECT COUNT(*) FROM questions", [], |row| row.get(0))?;
                let mut counts = HashMap::new();
                if total > 0 {
                    counts.insert(String::new(), total as u64);
                }
                return Ok(counts);
            }
            ScopeKind::Theme => "theme_id",
            ScopeKind::Subtheme => "subtheme_id",
            ScopeKind::Group => "group_id",
        };

        let sql = format!(
            "SELECT {col}, COUNT(*) FROM questions WHERE {col} IS NOT NULL GROUP BY {col}",
            col = column
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        Ok(rows.filter_map(log_and_skip_err).collect())
    }

    fn scope_filter(scope: &Scope) -> (&'static str, Option<&str>) {
        match scope {
            Scope::Global => ("", None),
            Scope::Theme(id) => ("WHERE theme_id = ?1", Some(id.as_str())),
            Scope::Subtheme(id) => ("WHERE subtheme_id = ?1", Some(id.as_str())),
            Scope::Group(id) => ("WHERE group_id = ?1", Some(id.as_str())),
        }
    }

    pub(crate) fn columns() -> &'static str {
        QUESTION_COLUMNS
    }

    pub(crate) fn row_to_question(row: &Row) -> rusqlite::Result<Question> {
        Ok(Question {
            id: row.get(0)?,
            title: row.get(1)?,
            question_text: row.get(2)?,
            explanation: row.get(3)?,
            theme_id: row.get(4)?,
            subtheme_id: row.get(5)?,
            group_id: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}
