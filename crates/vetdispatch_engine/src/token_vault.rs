//! Single-use action tokens.
//!
//! A token is 32 random bytes, URL-safe base64 without padding, bound to one
//! (case, candidate, action) triple. Redemption is the conditional
//! UNUSED -> CONSUMED write in the store; there is no read-then-write window.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use thiserror::Error;
use vetdispatch_db::{ActionTokenRecord, DbError, DispatchDb, SqliteConnection, TokenBinding};
use vetdispatch_ids::{CandidateId, CaseId};
use vetdispatch_protocol::ActionKind;

const TOKEN_BYTES: usize = 32;
/// Anything longer cannot be one of ours; rejected before touching the store.
const MAX_TOKEN_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Token not found")]
    TokenNotFound,

    #[error("Token already consumed for case {} / {}", .0.case_id, .0.candidate_id)]
    TokenAlreadyConsumed(TokenBinding),

    #[error("Token is bound to {actual}, not {expected}")]
    ActionMismatch {
        expected: ActionKind,
        actual: ActionKind,
    },

    #[error("An active token already exists for case {} / {} / {}", .0.case_id, .0.candidate_id, .0.action)]
    DuplicateActiveToken(TokenBinding),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Accept and decline links for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub accept: String,
    pub decline: String,
}

impl TokenPair {
    pub fn for_action(&self, action: ActionKind) -> &str {
        match action {
            ActionKind::Accept => &self.accept,
            ActionKind::Decline => &self.decline,
        }
    }
}

#[derive(Clone)]
pub struct TokenVault {
    db: DispatchDb,
}

impl TokenVault {
    pub fn new(db: DispatchDb) -> Self {
        Self { db }
    }

    pub fn generate_token() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Issue a token for the triple, or return the one already issued.
    ///
    /// Re-issue is idempotent so a retried notification carries the same links.
    pub async fn issue(
        &self,
        case_id: &CaseId,
        candidate_id: &CandidateId,
        action: ActionKind,
    ) -> Result<String, VaultError> {
        let mut tx = self.db.begin().await?;
        let token = Self::issue_in(&mut tx, &binding(case_id, candidate_id, action)).await?;
        tx.commit().await.map_err(DbError::from)?;
        Ok(token)
    }

    /// Issue a brand-new token; fails if the triple already has one.
    pub async fn issue_fresh(
        &self,
        case_id: &CaseId,
        candidate_id: &CandidateId,
        action: ActionKind,
    ) -> Result<String, VaultError> {
        let wanted = binding(case_id, candidate_id, action);
        let token = Self::generate_token();
        let mut tx = self.db.begin().await?;

        match DispatchDb::insert_token_strict_in(&mut tx, &token, &wanted, DispatchDb::now_millis())
            .await
        {
            Ok(()) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(token)
            }
            Err(err) if err.is_constraint_violation() => {
                let existing =
                    DispatchDb::get_token_for_in(&mut tx, case_id, candidate_id, action).await?;
                tx.rollback().await.map_err(DbError::from)?;
                match existing {
                    Some(record) if record.is_consumed() => {
                        Err(VaultError::TokenAlreadyConsumed(record.binding()))
                    }
                    _ => Err(VaultError::DuplicateActiveToken(wanted)),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Idempotent issue inside a caller's transaction.
    pub async fn issue_in(
        conn: &mut SqliteConnection,
        binding: &TokenBinding,
    ) -> Result<String, VaultError> {
        let token = Self::generate_token();
        if DispatchDb::insert_token_in(conn, &token, binding, DispatchDb::now_millis()).await? {
            return Ok(token);
        }

        let existing = DispatchDb::get_token_for_in(
            conn,
            &binding.case_id,
            &binding.candidate_id,
            binding.action,
        )
        .await?
        .ok_or_else(|| DbError::not_found("token vanished after conflicting insert"))?;
        Ok(existing.token)
    }

    /// Both links for a candidate, inside a caller's transaction.
    pub async fn issue_pair_in(
        conn: &mut SqliteConnection,
        case_id: &CaseId,
        candidate_id: &CandidateId,
    ) -> Result<TokenPair, VaultError> {
        let accept =
            Self::issue_in(conn, &binding(case_id, candidate_id, ActionKind::Accept)).await?;
        let decline =
            Self::issue_in(conn, &binding(case_id, candidate_id, ActionKind::Decline)).await?;
        Ok(TokenPair { accept, decline })
    }

    /// Redeem a token for whatever action it is bound to, in its own transaction.
    pub async fn redeem(&self, token: &str) -> Result<TokenBinding, VaultError> {
        let record = self.lookup(token).await?.ok_or(VaultError::TokenNotFound)?;

        let mut tx = self.db.begin().await?;
        let result = Self::redeem_in(&mut tx, token, record.action).await;
        match result {
            Ok(_) => tx.commit().await.map_err(DbError::from)?,
            Err(_) => tx.rollback().await.map_err(DbError::from)?,
        }
        result
    }

    /// Consume a token bound to `action` inside a caller's transaction.
    ///
    /// Must be the first statement of the transaction. Of two concurrent
    /// redemptions of one token exactly one gets `Ok`.
    pub async fn redeem_in(
        conn: &mut SqliteConnection,
        token: &str,
        action: ActionKind,
    ) -> Result<TokenBinding, VaultError> {
        if !plausible_token(token) {
            return Err(VaultError::TokenNotFound);
        }

        if let Some(bound) =
            DispatchDb::consume_token_in(conn, token, action, DispatchDb::now_millis()).await?
        {
            return Ok(bound);
        }

        match DispatchDb::get_token_in(conn, token).await? {
            None => Err(VaultError::TokenNotFound),
            Some(record) if record.action != action => Err(VaultError::ActionMismatch {
                expected: action,
                actual: record.action,
            }),
            Some(record) => Err(VaultError::TokenAlreadyConsumed(record.binding())),
        }
    }

    /// Read a token without consuming it.
    pub async fn lookup(&self, token: &str) -> Result<Option<ActionTokenRecord>, VaultError> {
        if !plausible_token(token) {
            return Ok(None);
        }
        Ok(self.db.get_token(token).await?)
    }
}

fn binding(case_id: &CaseId, candidate_id: &CandidateId, action: ActionKind) -> TokenBinding {
    TokenBinding {
        case_id: case_id.clone(),
        candidate_id: candidate_id.clone(),
        action,
    }
}

fn plausible_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
