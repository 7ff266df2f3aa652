//! Per-candidate dispatch rows.
//!
//! Every status change here is conditional on the row still being NOTIFIED,
//! so a row that has reached ACCEPTED, DECLINED, LOST or EXPIRED never moves
//! again.

use crate::error::Result;
use crate::types::*;
use crate::{parse_column, DispatchDb};
use sqlx::{Row, SqliteConnection};
use vetdispatch_ids::{CandidateId, CaseId};
use vetdispatch_protocol::CandidateStatus;

impl DispatchDb {
    /// Insert a NOTIFIED row, only while the case is OPEN.
    ///
    /// Returns false when the row already exists or the case has closed.
    pub async fn insert_candidate_in(
        conn: &mut SqliteConnection,
        case_id: &CaseId,
        candidate_id: &CandidateId,
        escalation_round: u32,
        now_millis: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO dispatch_candidates
                (case_id, candidate_id, status, escalation_round, notified_at)
            SELECT ?, ?, 'NOTIFIED', ?, ?
            WHERE EXISTS (SELECT 1 FROM dispatch_cases WHERE id = ? AND status = 'OPEN')
            "#,
        )
        .bind(case_id.as_str())
        .bind(candidate_id.as_str())
        .bind(escalation_round)
        .bind(now_millis)
        .bind(case_id.as_str())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// All dispatch rows for a case, in notification order.
    pub async fn list_dispatch_candidates(&self, case_id: &CaseId) -> Result<Vec<DispatchCandidate>> {
        let rows = sqlx::query("SELECT * FROM dispatch_candidates WHERE case_id = ? ORDER BY id ASC")
            .bind(case_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_candidate).collect()
    }

    pub async fn get_dispatch_candidate(
        &self,
        case_id: &CaseId,
        candidate_id: &CandidateId,
    ) -> Result<Option<DispatchCandidate>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_dispatch_candidate_in(&mut conn, case_id, candidate_id).await
    }

    pub async fn get_dispatch_candidate_in(
        conn: &mut SqliteConnection,
        case_id: &CaseId,
        candidate_id: &CandidateId,
    ) -> Result<Option<DispatchCandidate>> {
        let row =
            sqlx::query("SELECT * FROM dispatch_candidates WHERE case_id = ? AND candidate_id = ?")
                .bind(case_id.as_str())
                .bind(candidate_id.as_str())
                .fetch_optional(&mut *conn)
                .await?;

        row.as_ref().map(row_to_candidate).transpose()
    }

    /// NOTIFIED -> ACCEPTED for the claim winner.
    pub async fn mark_accepted_in(
        conn: &mut SqliteConnection,
        case_id: &CaseId,
        candidate_id: &CandidateId,
        now_millis: i64,
    ) -> Result<bool> {
        Self::transition_pending_in(
            conn,
            case_id,
            candidate_id,
            CandidateStatus::Accepted,
            now_millis,
        )
        .await
    }

    /// NOTIFIED -> DECLINED.
    pub async fn mark_declined_in(
        conn: &mut SqliteConnection,
        case_id: &CaseId,
        candidate_id: &CandidateId,
        now_millis: i64,
    ) -> Result<bool> {
        Self::transition_pending_in(
            conn,
            case_id,
            candidate_id,
            CandidateStatus::Declined,
            now_millis,
        )
        .await
    }

    /// NOTIFIED -> LOST for a single late accepter.
    pub async fn mark_lost_in(
        conn: &mut SqliteConnection,
        case_id: &CaseId,
        candidate_id: &CandidateId,
        now_millis: i64,
    ) -> Result<bool> {
        Self::transition_pending_in(conn, case_id, candidate_id, CandidateStatus::Lost, now_millis)
            .await
    }

    /// NOTIFIED -> LOST for every row except the winner; returns who lost.
    ///
    /// DECLINED rows are untouched.
    pub async fn mark_lost_except_in(
        conn: &mut SqliteConnection,
        case_id: &CaseId,
        winner: &CandidateId,
        now_millis: i64,
    ) -> Result<Vec<CandidateId>> {
        let losers: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE dispatch_candidates SET status = 'LOST', responded_at = ?
            WHERE case_id = ? AND candidate_id <> ? AND status = 'NOTIFIED'
            RETURNING candidate_id
            "#,
        )
        .bind(now_millis)
        .bind(case_id.as_str())
        .bind(winner.as_str())
        .fetch_all(&mut *conn)
        .await?;

        let mut losers = losers
            .iter()
            .map(|id| parse_column::<CandidateId>(id, "dispatch_candidates.candidate_id"))
            .collect::<Result<Vec<_>>>()?;
        losers.sort();
        Ok(losers)
    }

    /// How many rows of a case are ACCEPTED. Anything but 0 or 1 is a broken invariant.
    pub async fn count_accepted_in(conn: &mut SqliteConnection, case_id: &CaseId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dispatch_candidates WHERE case_id = ? AND status = 'ACCEPTED'",
        )
        .bind(case_id.as_str())
        .fetch_one(&mut *conn)
        .await?;

        Ok(count)
    }

    /// NOTIFIED -> EXPIRED for a case that closed without them.
    pub(crate) async fn expire_pending_candidates_in(
        conn: &mut SqliteConnection,
        case_id: &CaseId,
        now_millis: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_candidates SET status = 'EXPIRED', responded_at = ?
            WHERE case_id = ? AND status = 'NOTIFIED'
            "#,
        )
        .bind(now_millis)
        .bind(case_id.as_str())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    async fn transition_pending_in(
        conn: &mut SqliteConnection,
        case_id: &CaseId,
        candidate_id: &CandidateId,
        to: CandidateStatus,
        now_millis: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_candidates SET status = ?, responded_at = ?
            WHERE case_id = ? AND candidate_id = ? AND status = 'NOTIFIED'
            "#,
        )
        .bind(to.as_str())
        .bind(now_millis)
        .bind(case_id.as_str())
        .bind(candidate_id.as_str())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn row_to_candidate(row: &sqlx::sqlite::SqliteRow) -> Result<DispatchCandidate> {
    let case_id: String = row.get("case_id");
    let candidate_id: String = row.get("candidate_id");
    let status: String = row.get("status");

    Ok(DispatchCandidate {
        id: row.get("id"),
        case_id: parse_column(&case_id, "dispatch_candidates.case_id")?,
        candidate_id: parse_column(&candidate_id, "dispatch_candidates.candidate_id")?,
        status: parse_column(&status, "dispatch_candidates.status")?,
        escalation_round: row.get::<i64, _>("escalation_round") as u32,
        notified_at: DispatchDb::millis_to_datetime(row.get("notified_at")),
        responded_at: DispatchDb::opt_millis_to_datetime(row.get("responded_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::tests::{cand, lahore_cow};
    use crate::DbError;
    use std::time::Duration;

    async fn case_with_candidates(db: &DispatchDb, ids: &[&str]) -> Case {
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(60))
            .await
            .unwrap();
        let mut tx = db.begin().await.unwrap();
        for id in ids {
            assert!(
                DispatchDb::insert_candidate_in(&mut tx, &case.id, &cand(id), 0, 1)
                    .await
                    .unwrap()
            );
        }
        tx.commit().await.unwrap();
        case
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = case_with_candidates(&db, &["v1", "v2"]).await;

        let mut tx = db.begin().await.unwrap();
        assert!(
            !DispatchDb::insert_candidate_in(&mut tx, &case.id, &cand("v1"), 0, 2)
                .await
                .unwrap()
        );
        tx.commit().await.unwrap();

        let rows = db.list_dispatch_candidates(&case.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == CandidateStatus::Notified));
    }

    #[tokio::test]
    async fn test_no_rows_for_closed_case() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = case_with_candidates(&db, &[]).await;
        db.cancel_open_case(&case.id, 5).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        assert!(
            !DispatchDb::insert_candidate_in(&mut tx, &case.id, &cand("v1"), 0, 6)
                .await
                .unwrap()
        );
        tx.commit().await.unwrap();
        assert!(db.list_dispatch_candidates(&case.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_skips_declined_and_winner() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = case_with_candidates(&db, &["v1", "v2", "v3", "v4"]).await;

        let mut tx = db.begin().await.unwrap();
        assert!(DispatchDb::mark_declined_in(&mut tx, &case.id, &cand("v4"), 10)
            .await
            .unwrap());
        assert!(DispatchDb::claim_open_case_in(&mut tx, &case.id, &cand("v2"), 11)
            .await
            .unwrap());
        assert!(DispatchDb::mark_accepted_in(&mut tx, &case.id, &cand("v2"), 11)
            .await
            .unwrap());
        let losers = DispatchDb::mark_lost_except_in(&mut tx, &case.id, &cand("v2"), 11)
            .await
            .unwrap();
        assert_eq!(DispatchDb::count_accepted_in(&mut tx, &case.id).await.unwrap(), 1);
        tx.commit().await.unwrap();

        assert_eq!(losers, vec![cand("v1"), cand("v3")]);
        let v4 = db
            .get_dispatch_candidate(&case.id, &cand("v4"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v4.status, CandidateStatus::Declined);
    }

    #[tokio::test]
    async fn test_terminal_rows_do_not_move() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = case_with_candidates(&db, &["v1"]).await;

        let mut tx = db.begin().await.unwrap();
        assert!(DispatchDb::mark_declined_in(&mut tx, &case.id, &cand("v1"), 10)
            .await
            .unwrap());
        assert!(!DispatchDb::mark_accepted_in(&mut tx, &case.id, &cand("v1"), 11)
            .await
            .unwrap());
        assert!(!DispatchDb::mark_lost_in(&mut tx, &case.id, &cand("v1"), 11)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let row = db
            .get_dispatch_candidate(&case.id, &cand("v1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, CandidateStatus::Declined);
        assert!(row.responded_at.is_some());
    }

    #[tokio::test]
    async fn test_second_accepted_row_is_rejected_by_index() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = case_with_candidates(&db, &["v1", "v2"]).await;

        let mut tx = db.begin().await.unwrap();
        assert!(DispatchDb::mark_accepted_in(&mut tx, &case.id, &cand("v1"), 10)
            .await
            .unwrap());
        let err = DispatchDb::mark_accepted_in(&mut tx, &case.id, &cand("v2"), 10)
            .await
            .unwrap_err();
        tx.rollback().await.unwrap();

        assert!(matches!(err, DbError::Sqlx(_)));
        assert!(err.is_constraint_violation());
    }
}
