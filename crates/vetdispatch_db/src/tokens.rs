//! Action token storage.
//!
//! A token row is written once per (case, candidate, action) and consumed at
//! most once. Consumption is a single conditional UPDATE, never a read
//! followed by a write.

use crate::error::Result;
use crate::types::*;
use crate::{parse_column, DispatchDb};
use sqlx::{Row, SqliteConnection};
use vetdispatch_ids::{CandidateId, CaseId};
use vetdispatch_protocol::ActionKind;

impl DispatchDb {
    /// Store a token unless one already exists for the triple.
    ///
    /// Returns false if the triple already had a token; the caller reads it back.
    pub async fn insert_token_in(
        conn: &mut SqliteConnection,
        token: &str,
        binding: &TokenBinding,
        now_millis: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO action_tokens (token, case_id, candidate_id, action, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(token)
        .bind(binding.case_id.as_str())
        .bind(binding.candidate_id.as_str())
        .bind(binding.action.as_str())
        .bind(now_millis)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Store a token, failing on any existing token for the triple.
    pub async fn insert_token_strict_in(
        conn: &mut SqliteConnection,
        token: &str,
        binding: &TokenBinding,
        now_millis: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO action_tokens (token, case_id, candidate_id, action, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(token)
        .bind(binding.case_id.as_str())
        .bind(binding.candidate_id.as_str())
        .bind(binding.action.as_str())
        .bind(now_millis)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn get_token(&self, token: &str) -> Result<Option<ActionTokenRecord>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_token_in(&mut conn, token).await
    }

    pub async fn get_token_in(
        conn: &mut SqliteConnection,
        token: &str,
    ) -> Result<Option<ActionTokenRecord>> {
        let row = sqlx::query("SELECT * FROM action_tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(&mut *conn)
            .await?;

        row.as_ref().map(row_to_token).transpose()
    }

    pub async fn get_token_for(
        &self,
        case_id: &CaseId,
        candidate_id: &CandidateId,
        action: ActionKind,
    ) -> Result<Option<ActionTokenRecord>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_token_for_in(&mut conn, case_id, candidate_id, action).await
    }

    pub async fn get_token_for_in(
        conn: &mut SqliteConnection,
        case_id: &CaseId,
        candidate_id: &CandidateId,
        action: ActionKind,
    ) -> Result<Option<ActionTokenRecord>> {
        let row = sqlx::query(
            "SELECT * FROM action_tokens WHERE case_id = ? AND candidate_id = ? AND action = ?",
        )
        .bind(case_id.as_str())
        .bind(candidate_id.as_str())
        .bind(action.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(row_to_token).transpose()
    }

    /// Mark an unconsumed token of the given action consumed and return its binding.
    ///
    /// `None` means the token is unknown, bound to the other action, or already
    /// consumed; of two concurrent calls for one token exactly one gets `Some`.
    pub async fn consume_token_in(
        conn: &mut SqliteConnection,
        token: &str,
        action: ActionKind,
        now_millis: i64,
    ) -> Result<Option<TokenBinding>> {
        let row = sqlx::query(
            r#"
            UPDATE action_tokens SET consumed_at = ?
            WHERE token = ? AND action = ? AND consumed_at IS NULL
            RETURNING case_id, candidate_id, action
            "#,
        )
        .bind(now_millis)
        .bind(token)
        .bind(action.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let case_id: String = row.get("case_id");
        let candidate_id: String = row.get("candidate_id");
        let action: String = row.get("action");
        Ok(Some(TokenBinding {
            case_id: parse_column(&case_id, "action_tokens.case_id")?,
            candidate_id: parse_column(&candidate_id, "action_tokens.candidate_id")?,
            action: parse_column(&action, "action_tokens.action")?,
        }))
    }
}

fn row_to_token(row: &sqlx::sqlite::SqliteRow) -> Result<ActionTokenRecord> {
    let case_id: String = row.get("case_id");
    let candidate_id: String = row.get("candidate_id");
    let action: String = row.get("action");

    Ok(ActionTokenRecord {
        token: row.get("token"),
        case_id: parse_column(&case_id, "action_tokens.case_id")?,
        candidate_id: parse_column(&candidate_id, "action_tokens.candidate_id")?,
        action: parse_column(&action, "action_tokens.action")?,
        created_at: DispatchDb::millis_to_datetime(row.get("created_at")),
        consumed_at: DispatchDb::opt_millis_to_datetime(row.get("consumed_at")),
    })
}
