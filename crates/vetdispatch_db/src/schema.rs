//! Database schema creation for all dispatch tables.
//!
//! All CREATE TABLE statements live here - single source of truth.
//! Timestamps are INTEGER milliseconds since the Unix epoch.

use crate::error::Result;
use crate::DispatchDb;
use tracing::info;

pub(crate) const SCHEMA_VERSION: i64 = 1;

impl DispatchDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS dispatch_schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        self.create_case_tables().await?;
        self.create_token_tables().await?;
        self.create_delivery_tables().await?;
        self.create_roster_tables().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO dispatch_schema_version (version, applied_at) VALUES (?, ?)",
        )
        .bind(SCHEMA_VERSION)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        info!("Database schema verified");
        Ok(())
    }

    /// Cases and per-candidate dispatch rows.
    async fn create_case_tables(&self) -> Result<()> {
        // The assigned candidate is set exactly when the case is ASSIGNED.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS dispatch_cases (
                id TEXT PRIMARY KEY,
                city TEXT NOT NULL,
                state TEXT,
                address TEXT,
                species TEXT NOT NULL,
                issue TEXT NOT NULL,
                is_emergency INTEGER NOT NULL DEFAULT 0,
                consultation_kind TEXT NOT NULL,
                owner_name TEXT NOT NULL,
                owner_email TEXT,
                owner_phone TEXT,
                status TEXT NOT NULL DEFAULT 'OPEN'
                    CHECK (status IN ('OPEN', 'ASSIGNED', 'EXPIRED', 'CANCELLED')),
                assigned_candidate_id TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                closed_at INTEGER,
                dispatched_at INTEGER,
                dispatch_attempts INTEGER NOT NULL DEFAULT 0,
                last_dispatch_error TEXT,
                escalation_round INTEGER NOT NULL DEFAULT 0,
                escalated_at INTEGER,
                CHECK ((status = 'ASSIGNED') = (assigned_candidate_id IS NOT NULL))
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dispatch_cases_open ON dispatch_cases(status, expires_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS dispatch_candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                case_id TEXT NOT NULL REFERENCES dispatch_cases(id),
                candidate_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'NOTIFIED'
                    CHECK (status IN ('NOTIFIED', 'ACCEPTED', 'DECLINED', 'LOST', 'EXPIRED')),
                escalation_round INTEGER NOT NULL DEFAULT 0,
                notified_at INTEGER NOT NULL,
                responded_at INTEGER,
                UNIQUE (case_id, candidate_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // Last line of defence against a second winner.
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_dispatch_candidates_one_winner
               ON dispatch_candidates(case_id) WHERE status = 'ACCEPTED'"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Single-use action tokens. One row per (case, candidate, action).
    async fn create_token_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS action_tokens (
                token TEXT PRIMARY KEY,
                case_id TEXT NOT NULL REFERENCES dispatch_cases(id),
                candidate_id TEXT NOT NULL,
                action TEXT NOT NULL CHECK (action IN ('ACCEPT', 'DECLINE')),
                created_at INTEGER NOT NULL,
                consumed_at INTEGER,
                UNIQUE (case_id, candidate_id, action)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append-only log of every notification attempt.
    async fn create_delivery_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS email_delivery_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                case_id TEXT NOT NULL,
                candidate_id TEXT,
                recipient_email TEXT,
                recipient_name TEXT,
                recipient_type TEXT NOT NULL,
                message_kind TEXT NOT NULL,
                subject TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING'
                    CHECK (status IN ('PENDING', 'SENT', 'FAILED')),
                attempts INTEGER NOT NULL DEFAULT 0,
                error_detail TEXT,
                created_at INTEGER NOT NULL,
                sent_at INTEGER
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delivery_log_case ON email_delivery_log(case_id, message_kind)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delivery_log_recipient ON email_delivery_log(recipient_email)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Vet roster backing the default candidate source.
    async fn create_roster_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS vet_roster (
                candidate_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                city TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                available INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS vet_roster_species (
                candidate_id TEXT NOT NULL REFERENCES vet_roster(candidate_id) ON DELETE CASCADE,
                species TEXT NOT NULL,
                PRIMARY KEY (candidate_id, species)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
