//! Email delivery log: one row per notification attempt.
//!
//! Rows are written PENDING before the send and move exactly once to SENT or
//! FAILED. Nothing here ever deletes a row.

use crate::error::Result;
use crate::types::*;
use crate::{parse_column, DispatchDb};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;
use vetdispatch_ids::{CandidateId, CaseId};
use vetdispatch_protocol::{DeliveryStatus, MessageKind};

const DEFAULT_LIST_LIMIT: u32 = 100;

impl DispatchDb {
    /// Append a PENDING row and return its id.
    pub async fn log_pending(&self, delivery: &NewDelivery) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_delivery_log (
                case_id, candidate_id, recipient_email, recipient_name,
                recipient_type, message_kind, subject, status, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 'PENDING', ?)
            "#,
        )
        .bind(delivery.case_id.as_str())
        .bind(delivery.candidate_id.as_ref().map(|id| id.as_str()))
        .bind(delivery.recipient_email.as_deref())
        .bind(delivery.recipient_name.as_deref())
        .bind(delivery.recipient_type.as_str())
        .bind(delivery.message_kind.as_str())
        .bind(&delivery.subject)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// PENDING -> SENT. Returns false if the row was already final.
    pub async fn mark_sent(&self, id: i64, attempts: u32) -> Result<bool> {
        let now = Self::now_millis();
        let result = sqlx::query(
            r#"
            UPDATE email_delivery_log SET status = 'SENT', attempts = ?, sent_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(attempts)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// PENDING -> FAILED with error detail. Returns false if the row was already final.
    pub async fn mark_failed(&self, id: i64, attempts: u32, error_detail: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE email_delivery_log SET status = 'FAILED', attempts = ?, error_detail = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(attempts)
        .bind(error_detail)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_delivery(&self, id: i64) -> Result<Option<DeliveryLogEntry>> {
        let row = sqlx::query("SELECT * FROM email_delivery_log WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_delivery).transpose()
    }

    /// List log rows matching the filter, newest first.
    pub async fn list_deliveries(&self, filter: &DeliveryFilter) -> Result<Vec<DeliveryLogEntry>> {
        let mut query: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM email_delivery_log WHERE 1=1");

        if let Some(ref case_id) = filter.case_id {
            query.push(" AND case_id = ").push_bind(case_id.as_str());
        }
        if let Some(ref candidate_id) = filter.candidate_id {
            query
                .push(" AND candidate_id = ")
                .push_bind(candidate_id.as_str());
        }
        if let Some(ref email) = filter.recipient_email {
            query
                .push(" AND lower(recipient_email) = lower(")
                .push_bind(email.trim())
                .push(")");
        }
        if let Some(kind) = filter.message_kind {
            query.push(" AND message_kind = ").push_bind(kind.as_str());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }

        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_delivery).collect()
    }

    /// Per (message kind, status) counts for one case.
    pub async fn delivery_counts(&self, case_id: &CaseId) -> Result<Vec<DeliveryCount>> {
        let rows = sqlx::query(
            r#"
            SELECT message_kind, status, COUNT(*) AS count
            FROM email_delivery_log
            WHERE case_id = ?
            GROUP BY message_kind, status
            ORDER BY message_kind, status
            "#,
        )
        .bind(case_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("message_kind");
                let status: String = row.get("status");
                Ok(DeliveryCount {
                    message_kind: parse_column(&kind, "email_delivery_log.message_kind")?,
                    status: parse_column(&status, "email_delivery_log.status")?,
                    count: row.get::<i64, _>("count") as u64,
                })
            })
            .collect()
    }

    /// Candidates of a case that already have a SENT message of this kind.
    pub async fn delivered_candidates(
        &self,
        case_id: &CaseId,
        kind: MessageKind,
    ) -> Result<HashSet<CandidateId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT candidate_id FROM email_delivery_log
            WHERE case_id = ? AND message_kind = ? AND status = 'SENT'
              AND candidate_id IS NOT NULL
            "#,
        )
        .bind(case_id.as_str())
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        ids.iter()
            .map(|id| parse_column::<CandidateId>(id, "email_delivery_log.candidate_id"))
            .collect()
    }
}

fn row_to_delivery(row: &sqlx::sqlite::SqliteRow) -> Result<DeliveryLogEntry> {
    let case_id: String = row.get("case_id");
    let candidate_id: Option<String> = row.get("candidate_id");
    let recipient_type: String = row.get("recipient_type");
    let message_kind: String = row.get("message_kind");
    let status: String = row.get("status");

    Ok(DeliveryLogEntry {
        id: row.get("id"),
        case_id: parse_column(&case_id, "email_delivery_log.case_id")?,
        candidate_id: candidate_id
            .as_deref()
            .map(|id| parse_column(id, "email_delivery_log.candidate_id"))
            .transpose()?,
        recipient_email: row.get("recipient_email"),
        recipient_name: row.get("recipient_name"),
        recipient_type: parse_column(&recipient_type, "email_delivery_log.recipient_type")?,
        message_kind: parse_column(&message_kind, "email_delivery_log.message_kind")?,
        subject: row.get("subject"),
        status: parse_column::<DeliveryStatus>(&status, "email_delivery_log.status")?,
        attempts: row.get::<i64, _>("attempts") as u32,
        error_detail: row.get("error_detail"),
        created_at: DispatchDb::millis_to_datetime(row.get("created_at")),
        sent_at: DispatchDb::opt_millis_to_datetime(row.get("sent_at")),
    })
}
