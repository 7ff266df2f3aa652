//! Candidate selection.
//!
//! Eligibility rules live behind [`CandidateSource`]; the selector only
//! normalizes what comes back (dedupe, stable order) and turns source
//! failures into [`SelectionError::SelectionUnavailable`].

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use vetdispatch_db::{Case, DbError};
use vetdispatch_ids::CandidateId;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("Candidate source unavailable: {0}")]
    SelectionUnavailable(String),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl SelectionError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::SelectionUnavailable(msg.into())
    }
}

/// Supplies the vets eligible for a case.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Vets in `city` covering `species`, optionally only those marked available.
    async fn find_eligible(
        &self,
        city: &str,
        species: &str,
        exclude_unavailable: bool,
    ) -> Result<Vec<CandidateId>, SelectionError>;

    /// Candidates for escalation round `round` (1-based) of an unanswered case.
    ///
    /// Any widening of the search belongs to the source; the default asks the
    /// same question again so newly available vets are picked up.
    async fn find_escalated(
        &self,
        case: &Case,
        round: u32,
    ) -> Result<Vec<CandidateId>, SelectionError> {
        let _ = round;
        self.find_eligible(&case.city, &case.species, true).await
    }
}

/// How to reach a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateContact {
    pub candidate_id: CandidateId,
    pub display_name: String,
    pub email: String,
}

/// Resolves contact details for fan-out.
#[async_trait]
pub trait CandidateDirectory: Send + Sync {
    /// `Ok(None)` when the candidate has no usable address on file.
    async fn contact(&self, candidate_id: &CandidateId)
        -> Result<Option<CandidateContact>, DbError>;
}

#[derive(Clone)]
pub struct CandidateSelector {
    source: Arc<dyn CandidateSource>,
}

impl CandidateSelector {
    pub fn new(source: Arc<dyn CandidateSource>) -> Self {
        Self { source }
    }

    /// Eligible candidates for a freshly opened case, deduplicated, source order kept.
    pub async fn select(&self, case: &Case) -> Result<Vec<CandidateId>, SelectionError> {
        let found = self
            .source
            .find_eligible(&case.city, &case.species, true)
            .await?;
        Ok(dedupe(found))
    }

    /// Candidates for an escalation round, deduplicated.
    pub async fn select_escalated(
        &self,
        case: &Case,
        round: u32,
    ) -> Result<Vec<CandidateId>, SelectionError> {
        let found = self.source.find_escalated(case, round).await?;
        Ok(dedupe(found))
    }
}

fn dedupe(found: Vec<CandidateId>) -> Vec<CandidateId> {
    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use vetdispatch_db::{DispatchDb, NewCase};
    use vetdispatch_protocol::ConsultationKind;

    struct Fixed {
        ids: Vec<&'static str>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CandidateSource for Fixed {
        async fn find_eligible(
            &self,
            _city: &str,
            _species: &str,
            exclude_unavailable: bool,
        ) -> Result<Vec<CandidateId>, SelectionError> {
            assert!(exclude_unavailable);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .ids
                .iter()
                .map(|id| CandidateId::parse(id).unwrap())
                .collect())
        }
    }

    struct Down;

    #[async_trait]
    impl CandidateSource for Down {
        async fn find_eligible(
            &self,
            _city: &str,
            _species: &str,
            _exclude_unavailable: bool,
        ) -> Result<Vec<CandidateId>, SelectionError> {
            Err(SelectionError::unavailable("connection refused"))
        }
    }

    async fn sample_case() -> Case {
        let db = DispatchDb::open_in_memory().await.unwrap();
        db.insert_case(
            &NewCase {
                city: "Lahore".into(),
                state: None,
                address: None,
                species: "Cow".into(),
                issue: "fever".into(),
                is_emergency: true,
                consultation_kind: ConsultationKind::Virtual,
                owner_name: "Owner".into(),
                owner_email: None,
                owner_phone: None,
                ttl_secs: None,
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_select_dedupes_in_source_order() {
        let source = Arc::new(Fixed {
            ids: vec!["v3", "v1", "v3", "v2"],
            calls: AtomicU32::new(0),
        });
        let selector = CandidateSelector::new(source.clone());
        let case = sample_case().await;

        let picked = selector.select(&case).await.unwrap();
        let names: Vec<&str> = picked.iter().map(|c| c.as_str()).collect();
        assert_eq!(names, vec!["v3", "v1", "v2"]);

        selector.select_escalated(&case, 1).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_source_failure_is_selection_unavailable() {
        let selector = CandidateSelector::new(Arc::new(Down));
        let err = selector.select(&sample_case().await).await.unwrap_err();
        assert!(matches!(err, SelectionError::SelectionUnavailable(_)));
    }
}
