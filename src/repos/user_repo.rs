//! 用户二级索引：作答记录、收藏、按作用域的统计计数器
//!
//! 计数器使用单条 `INSERT ... ON CONFLICT DO UPDATE SET n = n + 1` 原子自增，
//! 并发提交作答时不会丢失更新。计数器写入失败只记录日志，不影响作答主记录。

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::log_and_skip_err;
use super::question_repo::QuestionRepo;
use crate::database::QbankDatabase;
use crate::error::{QbankError, QbankResult};
use crate::models::{Question, Scope};

/// 用户在某个作用域下的累计统计
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserScopeStats {
    pub user_id: String,
    pub scope: Scope,
    pub answered: u64,
    pub correct: u64,
    pub incorrect: u64,
}

pub struct UserRepo;

impl UserRepo {
    // ========================================================================
    // 作答
    // ========================================================================

    /// 记录一次作答
    ///
    /// 1. upsert `user_answers`（主记录，失败即返回错误）
    /// 2. 对题目所属的每个作用域自增计数器（尽力而为）
    pub fn record_answer(
        db: &QbankDatabase,
        user_id: &str,
        question_id: &str,
        is_correct: bool,
    ) -> QbankResult<()> {
        let conn = db.get_conn_safe()?;
        let question = QuestionRepo::get_question_with_conn(&conn, question_id)?
            .ok_or_else(|| QbankError::not_found("question", question_id))?;

        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO user_answers (user_id, question_id, is_correct, answered_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, question_id) DO UPDATE SET
                is_correct = excluded.is_correct,
                answered_at = excluded.answered_at
            "#,
            params![user_id, question_id, is_correct, now],
        )?;

        for scope in question.scopes() {
            if let Err(e) = Self::bump_scope_stats_with_conn(&conn, user_id, &scope, is_correct) {
                warn!(
                    user_id = %user_id,
                    question_id = %question_id,
                    scope = ?scope,
                    error = %e,
                    "[Qbank::UserRepo] Failed to bump scope counter (ignored)"
                );
            }
        }

        debug!(
            "[Qbank::UserRepo] Recorded answer user={} question={} correct={}",
            user_id, question_id, is_correct
        );
        Ok(())
    }

    fn bump_scope_stats_with_conn(
        conn: &Connection,
        user_id: &str,
        scope: &Scope,
        is_correct: bool,
    ) -> QbankResult<()> {
        let (correct, incorrect) = if is_correct { (1, 0) } else { (0, 1) };
        conn.execute(
            r#"
            INSERT INTO user_scope_stats
                (user_id, scope_kind, scope_id, answered, correct, incorrect, updated_at)
            VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)
            ON CONFLICT(user_id, scope_kind, scope_id) DO UPDATE SET
                answered = answered + 1,
                correct = correct + excluded.correct,
                incorrect = incorrect + excluded.incorrect,
                updated_at = excluded.updated_at
            "#,
            params![
                user_id,
                scope.kind().as_str(),
                scope.namespace(),
                correct,
                incorrect,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// 读取用户全部作用域计数器
    pub fn scope_stats(db: &QbankDatabase, user_id: &str) -> QbankResult<Vec<UserScopeStats>> {
        let conn = db.get_conn_safe()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT scope_kind, scope_id, answered, correct, incorrect
            FROM user_scope_stats
            WHERE user_id = ?1
            ORDER BY scope_kind, scope_id
            "#,
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let kind: String = row.get(0)?;
            let id: String = row.get(1)?;
            let scope = match kind.as_str() {
                "theme" => Scope::Theme(id),
                "subtheme" => Scope::Subtheme(id),
                "group" => Scope::Group(id),
                _ => Scope::Global,
            };
            Ok(UserScopeStats {
                user_id: user_id.to_string(),
                scope,
                answered: row.get::<_, i64>(2)? as u64,
                correct: row.get::<_, i64>(3)? as u64,
                incorrect: row.get::<_, i64>(4)? as u64,
            })
        })?;
        Ok(rows.filter_map(log_and_skip_err).collect())
    }

    // ========================================================================
    // 收藏
    // ========================================================================

    pub fn set_bookmark(
        db: &QbankDatabase,
        user_id: &str,
        question_id: &str,
        bookmarked: bool,
    ) -> QbankResult<()> {
        let conn = db.get_conn_safe()?;
        if bookmarked {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO user_bookmarks (user_id, question_id, created_at)
                VALUES (?1, ?2, ?3)
                "#,
                params![user_id, question_id, chrono::Utc::now().to_rfc3339()],
            )?;
        } else {
            conn.execute(
                "DELETE FROM user_bookmarks WHERE user_id = ?1 AND question_id = ?2",
                params![user_id, question_id],
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // 候选集查询
    // ========================================================================

    /// 最近一次作答错误的题目
    pub fn incorrect_questions(db: &QbankDatabase, user_id: &str) -> QbankResult<Vec<Question>> {
        Self::questions_where(
            db,
            user_id,
            "id IN (SELECT question_id FROM user_answers WHERE user_id = ?1 AND is_correct = 0)",
        )
    }

    /// 全部题目减去用户已作答的题目
    pub fn unanswered_questions(db: &QbankDatabase, user_id: &str) -> QbankResult<Vec<Question>> {
        Self::questions_where(
            db,
            user_id,
            "id NOT IN (SELECT question_id FROM user_answers WHERE user_id = ?1)",
        )
    }

    pub fn bookmarked_questions(db: &QbankDatabase, user_id: &str) -> QbankResult<Vec<Question>> {
        Self::questions_where(
            db,
            user_id,
            "id IN (SELECT question_id FROM user_bookmarks WHERE user_id = ?1)",
        )
    }

    fn questions_where(
        db: &QbankDatabase,
        user_id: &str,
        condition: &str,
    ) -> QbankResult<Vec<Question>> {
        let conn = db.get_conn_safe()?;
        let sql = format!(
            "SELECT {} FROM questions WHERE {} ORDER BY id",
            QuestionRepo::columns(),
            condition
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], QuestionRepo::row_to_question)?;
        Ok(rows.filter_map(log_and_skip_err).collect())
    }
}
