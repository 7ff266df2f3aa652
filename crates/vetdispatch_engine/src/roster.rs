//! Roster-backed candidate source and directory used by the binary.

use crate::selector::{CandidateContact, CandidateDirectory, CandidateSource, SelectionError};
use async_trait::async_trait;
use tracing::warn;
use vetdispatch_db::{DbError, DispatchDb};
use vetdispatch_ids::CandidateId;

#[derive(Clone)]
pub struct RosterCandidateSource {
    db: DispatchDb,
}

impl RosterCandidateSource {
    pub fn new(db: DispatchDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CandidateSource for RosterCandidateSource {
    async fn find_eligible(
        &self,
        city: &str,
        species: &str,
        exclude_unavailable: bool,
    ) -> Result<Vec<CandidateId>, SelectionError> {
        self.db
            .find_eligible_vets(city, species, exclude_unavailable)
            .await
            .map_err(|err| {
                warn!(error = %err, city, species, "Roster lookup failed");
                SelectionError::unavailable(err.to_string())
            })
    }
}

#[async_trait]
impl CandidateDirectory for RosterCandidateSource {
    async fn contact(
        &self,
        candidate_id: &CandidateId,
    ) -> Result<Option<CandidateContact>, DbError> {
        let Some(entry) = self.db.get_roster_entry(candidate_id).await? else {
            return Ok(None);
        };

        let email = entry
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| e.contains('@'));

        Ok(email.map(|email| CandidateContact {
            candidate_id: entry.candidate_id,
            display_name: entry.display_name,
            email,
        }))
    }
}
