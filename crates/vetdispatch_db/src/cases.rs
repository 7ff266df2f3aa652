//! Case rows: intake insert, lookups and every conditional transition out of OPEN.

use crate::error::{DbError, Result};
use crate::types::*;
use crate::{parse_column, DispatchDb};
use sqlx::{Row, SqliteConnection};
use std::time::Duration;
use tracing::debug;
use vetdispatch_ids::{CandidateId, CaseId};
use vetdispatch_protocol::CaseStatus;

impl DispatchDb {
    // ========================================================================
    // Intake
    // ========================================================================

    /// Insert a new OPEN case expiring `ttl` from now.
    pub async fn insert_case(&self, new_case: &NewCase, ttl: Duration) -> Result<Case> {
        let city = new_case.city.trim();
        let species = new_case.species.trim();
        if city.is_empty() || species.is_empty() {
            return Err(DbError::constraint("case requires a city and a species"));
        }

        let id = CaseId::new();
        let now = Self::now_millis();
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_millis);

        sqlx::query(
            r#"
            INSERT INTO dispatch_cases (
                id, city, state, address, species, issue, is_emergency, consultation_kind,
                owner_name, owner_email, owner_phone, status, created_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'OPEN', ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(city)
        .bind(new_case.state.as_deref())
        .bind(new_case.address.as_deref())
        .bind(species)
        .bind(&new_case.issue)
        .bind(new_case.is_emergency)
        .bind(new_case.consultation_kind.as_str())
        .bind(&new_case.owner_name)
        .bind(new_case.owner_email.as_deref())
        .bind(new_case.owner_phone.as_deref())
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        debug!(case_id = %id, city, species, "Case inserted");

        self.get_case(&id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("case {} vanished after insert", id)))
    }

    /// Get a case by ID.
    pub async fn get_case(&self, id: &CaseId) -> Result<Option<Case>> {
        let row = sqlx::query("SELECT * FROM dispatch_cases WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_case).transpose()
    }

    /// OPEN cases whose deadline is at or before `now_millis`, oldest deadline first.
    pub async fn list_due_open_cases(&self, now_millis: i64, limit: u32) -> Result<Vec<Case>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM dispatch_cases
            WHERE status = 'OPEN' AND expires_at <= ?
            ORDER BY expires_at ASC
            LIMIT ?
            "#,
        )
        .bind(now_millis)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_case).collect()
    }

    /// OPEN, not yet due, and never successfully dispatched.
    pub async fn list_undispatched_cases(&self, now_millis: i64, limit: u32) -> Result<Vec<Case>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM dispatch_cases
            WHERE status = 'OPEN' AND dispatched_at IS NULL AND expires_at > ?
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(now_millis)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_case).collect()
    }

    /// Record a failed selection pass. The case stays OPEN and undispatched.
    pub async fn record_dispatch_failure(&self, id: &CaseId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dispatch_cases SET
                dispatch_attempts = dispatch_attempts + 1,
                last_dispatch_error = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Conditional transitions
    // ========================================================================

    /// OPEN -> EXPIRED, only if the deadline has really passed.
    ///
    /// NOTIFIED rows move to EXPIRED in the same transaction. With
    /// `flag_for_operator` the case is also stamped `escalated_at`.
    /// Returns false when the case was no longer OPEN (claimed, cancelled,
    /// extended or already expired by another sweeper).
    pub async fn expire_open_case(
        &self,
        id: &CaseId,
        now_millis: i64,
        flag_for_operator: bool,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if !Self::expire_open_case_in(&mut tx, id, now_millis, flag_for_operator).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// [`expire_open_case`](Self::expire_open_case) inside the caller's transaction.
    pub async fn expire_open_case_in(
        conn: &mut SqliteConnection,
        id: &CaseId,
        now_millis: i64,
        flag_for_operator: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_cases SET
                status = 'EXPIRED',
                closed_at = ?,
                escalated_at = CASE WHEN ? THEN ? ELSE escalated_at END
            WHERE id = ? AND status = 'OPEN' AND expires_at <= ?
            "#,
        )
        .bind(now_millis)
        .bind(flag_for_operator)
        .bind(now_millis)
        .bind(id.as_str())
        .bind(now_millis)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        Self::expire_pending_candidates_in(conn, id, now_millis).await?;
        Ok(true)
    }

    /// OPEN -> CANCELLED. NOTIFIED rows move to EXPIRED in the same transaction.
    pub async fn cancel_open_case(&self, id: &CaseId, now_millis: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE dispatch_cases SET status = 'CANCELLED', closed_at = ? WHERE id = ? AND status = 'OPEN'",
        )
        .bind(now_millis)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::expire_pending_candidates_in(&mut tx, id, now_millis).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// OPEN -> ASSIGNED for `winner`. The compare-and-set every claim goes through.
    ///
    /// A case past its deadline cannot be claimed, swept or not.
    pub async fn claim_open_case_in(
        conn: &mut SqliteConnection,
        id: &CaseId,
        winner: &CandidateId,
        now_millis: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_cases SET
                status = 'ASSIGNED',
                assigned_candidate_id = ?,
                closed_at = ?
            WHERE id = ? AND status = 'OPEN' AND expires_at > ?
            "#,
        )
        .bind(winner.as_str())
        .bind(now_millis)
        .bind(id.as_str())
        .bind(now_millis)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Push the deadline of an OPEN case and bump its escalation round.
    ///
    /// Compare-and-set on the round, so two sweepers cannot both rebroadcast.
    pub async fn extend_open_case_in(
        conn: &mut SqliteConnection,
        id: &CaseId,
        expected_round: u32,
        new_expires_at: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_cases SET
                expires_at = ?,
                escalation_round = escalation_round + 1
            WHERE id = ? AND status = 'OPEN' AND escalation_round = ?
            "#,
        )
        .bind(new_expires_at)
        .bind(id.as_str())
        .bind(expected_round)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Stamp a successful dispatch (first one wins) inside the dispatch transaction.
    pub async fn record_dispatch_success_in(
        conn: &mut SqliteConnection,
        id: &CaseId,
        now_millis: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dispatch_cases SET
                dispatch_attempts = dispatch_attempts + 1,
                dispatched_at = COALESCE(dispatched_at, ?),
                last_dispatch_error = NULL
            WHERE id = ?
            "#,
        )
        .bind(now_millis)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn get_case_in(conn: &mut SqliteConnection, id: &CaseId) -> Result<Option<Case>> {
        let row = sqlx::query("SELECT * FROM dispatch_cases WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await?;

        row.as_ref().map(row_to_case).transpose()
    }

    pub async fn case_status_in(
        conn: &mut SqliteConnection,
        id: &CaseId,
    ) -> Result<Option<CaseStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM dispatch_cases WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&mut *conn)
                .await?;

        status
            .map(|s| parse_column::<CaseStatus>(&s, "dispatch_cases.status"))
            .transpose()
    }
}

pub(crate) fn row_to_case(row: &sqlx::sqlite::SqliteRow) -> Result<Case> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let consultation_kind: String = row.get("consultation_kind");
    let assigned: Option<String> = row.get("assigned_candidate_id");

    Ok(Case {
        id: parse_column(&id, "dispatch_cases.id")?,
        city: row.get("city"),
        state: row.get("state"),
        address: row.get("address"),
        species: row.get("species"),
        issue: row.get("issue"),
        is_emergency: row.get::<i64, _>("is_emergency") != 0,
        consultation_kind: parse_column(&consultation_kind, "dispatch_cases.consultation_kind")?,
        owner_name: row.get("owner_name"),
        owner_email: row.get("owner_email"),
        owner_phone: row.get("owner_phone"),
        status: parse_column(&status, "dispatch_cases.status")?,
        assigned_candidate_id: assigned
            .as_deref()
            .map(|s| parse_column(s, "dispatch_cases.assigned_candidate_id"))
            .transpose()?,
        created_at: DispatchDb::millis_to_datetime(row.get("created_at")),
        expires_at: DispatchDb::millis_to_datetime(row.get("expires_at")),
        closed_at: DispatchDb::opt_millis_to_datetime(row.get("closed_at")),
        dispatched_at: DispatchDb::opt_millis_to_datetime(row.get("dispatched_at")),
        dispatch_attempts: row.get::<i64, _>("dispatch_attempts") as u32,
        last_dispatch_error: row.get("last_dispatch_error"),
        escalation_round: row.get::<i64, _>("escalation_round") as u32,
        escalated_at: DispatchDb::opt_millis_to_datetime(row.get("escalated_at")),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use vetdispatch_protocol::{CandidateStatus, ConsultationKind};

    pub(crate) fn lahore_cow() -> NewCase {
        NewCase {
            city: "Lahore".to_string(),
            state: Some("Punjab".to_string()),
            address: Some("12 Canal Road".to_string()),
            species: "Cow".to_string(),
            issue: "Not eating since yesterday".to_string(),
            is_emergency: false,
            consultation_kind: ConsultationKind::Physical,
            owner_name: "Ayesha Khan".to_string(),
            owner_email: Some("ayesha@example.com".to_string()),
            owner_phone: Some("+92 300 0000000".to_string()),
            ttl_secs: None,
        }
    }

    pub(crate) fn cand(id: &str) -> CandidateId {
        CandidateId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get_case() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(case.status, CaseStatus::Open);
        assert_eq!(case.location_label(), "Lahore, Punjab");
        assert!(case.assigned_candidate_id.is_none());
        assert!(case.expires_at > case.created_at);

        let fetched = db.get_case(&case.id).await.unwrap().unwrap();
        assert_eq!(fetched.owner_name, "Ayesha Khan");
        assert_eq!(fetched.consultation_kind, ConsultationKind::Physical);
    }

    #[tokio::test]
    async fn test_insert_rejects_blank_city() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let mut new_case = lahore_cow();
        new_case.city = "   ".to_string();
        let err = db
            .insert_case(&new_case, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(60))
            .await
            .unwrap();
        let now = DispatchDb::now_millis();

        let mut tx = db.begin().await.unwrap();
        assert!(DispatchDb::claim_open_case_in(&mut tx, &case.id, &cand("v1"), now)
            .await
            .unwrap());
        assert!(!DispatchDb::claim_open_case_in(&mut tx, &case.id, &cand("v2"), now)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let case = db.get_case(&case.id).await.unwrap().unwrap();
        assert_eq!(case.status, CaseStatus::Assigned);
        assert_eq!(case.assigned_candidate_id, Some(cand("v1")));
        assert!(case.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_refused_after_deadline() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(60))
            .await
            .unwrap();
        let deadline = case.expires_at.timestamp_millis();

        let mut tx = db.begin().await.unwrap();
        assert!(!DispatchDb::claim_open_case_in(&mut tx, &case.id, &cand("v1"), deadline)
            .await
            .unwrap());
        assert!(DispatchDb::expire_open_case_in(&mut tx, &case.id, deadline, false)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let case = db.get_case(&case.id).await.unwrap().unwrap();
        assert_eq!(case.status, CaseStatus::Expired);
        assert!(case.assigned_candidate_id.is_none());
    }

    #[tokio::test]
    async fn test_assigned_requires_candidate() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(60))
            .await
            .unwrap();

        let err = sqlx::query("UPDATE dispatch_cases SET status = 'ASSIGNED' WHERE id = ?")
            .bind(case.id.as_str())
            .execute(db.pool())
            .await
            .map_err(DbError::from)
            .unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[tokio::test]
    async fn test_expire_only_after_deadline_and_once() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(60))
            .await
            .unwrap();

        let mut tx = db.begin().await.unwrap();
        DispatchDb::insert_candidate_in(&mut tx, &case.id, &cand("v1"), 0, 0)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let before_deadline = case.created_at.timestamp_millis();
        assert!(!db
            .expire_open_case(&case.id, before_deadline, false)
            .await
            .unwrap());

        let after_deadline = case.expires_at.timestamp_millis();
        assert!(db
            .expire_open_case(&case.id, after_deadline, false)
            .await
            .unwrap());
        assert!(!db
            .expire_open_case(&case.id, after_deadline, false)
            .await
            .unwrap());

        let case = db.get_case(&case.id).await.unwrap().unwrap();
        assert_eq!(case.status, CaseStatus::Expired);
        assert!(case.escalated_at.is_none());

        let row = db
            .get_dispatch_candidate(&case.id, &cand("v1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, CandidateStatus::Expired);
    }

    #[tokio::test]
    async fn test_expire_for_operator_stamps_escalation() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(1))
            .await
            .unwrap();

        let due = case.expires_at.timestamp_millis();
        assert!(db.expire_open_case(&case.id, due, true).await.unwrap());
        let case = db.get_case(&case.id).await.unwrap().unwrap();
        assert!(case.escalated_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_blocks_claim() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(60))
            .await
            .unwrap();
        let now = DispatchDb::now_millis();

        assert!(db.cancel_open_case(&case.id, now).await.unwrap());
        assert!(!db.cancel_open_case(&case.id, now).await.unwrap());

        let mut tx = db.begin().await.unwrap();
        assert!(!DispatchDb::claim_open_case_in(&mut tx, &case.id, &cand("v1"), now)
            .await
            .unwrap());
        let status = DispatchDb::case_status_in(&mut tx, &case.id).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(status, Some(CaseStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_extend_is_compare_and_set_on_round() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(60))
            .await
            .unwrap();
        let later = case.expires_at.timestamp_millis() + 60_000;

        let mut tx = db.begin().await.unwrap();
        assert!(DispatchDb::extend_open_case_in(&mut tx, &case.id, 0, later)
            .await
            .unwrap());
        assert!(!DispatchDb::extend_open_case_in(&mut tx, &case.id, 0, later)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let case = db.get_case(&case.id).await.unwrap().unwrap();
        assert_eq!(case.escalation_round, 1);
        assert_eq!(case.expires_at.timestamp_millis(), later);
    }

    #[tokio::test]
    async fn test_undispatched_listing_and_bookkeeping() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(60))
            .await
            .unwrap();
        let now = DispatchDb::now_millis();

        db.record_dispatch_failure(&case.id, "roster offline")
            .await
            .unwrap();
        let pending = db.list_undispatched_cases(now, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].dispatch_attempts, 1);
        assert_eq!(pending[0].last_dispatch_error.as_deref(), Some("roster offline"));

        let mut tx = db.begin().await.unwrap();
        DispatchDb::record_dispatch_success_in(&mut tx, &case.id, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(db.list_undispatched_cases(now, 10).await.unwrap().is_empty());
        let case = db.get_case(&case.id).await.unwrap().unwrap();
        assert_eq!(case.dispatch_attempts, 2);
        assert!(case.last_dispatch_error.is_none());
        assert!(case.dispatched_at.is_some());
    }

    #[tokio::test]
    async fn test_due_listing() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(&lahore_cow(), Duration::from_secs(60))
            .await
            .unwrap();

        let now = case.created_at.timestamp_millis();
        assert!(db.list_due_open_cases(now, 10).await.unwrap().is_empty());
        let due = db
            .list_due_open_cases(case.expires_at.timestamp_millis(), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }
}
