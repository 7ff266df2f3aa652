//! Candidate sources and directories whose answers the test controls.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use vetdispatch_db::{Case, DbError};
use vetdispatch_engine::{CandidateContact, CandidateDirectory, CandidateSource, SelectionError};
use vetdispatch_ids::CandidateId;

use crate::fixtures::candidate_ids;

/// Returns the same list for every case. The list can be swapped mid-test,
/// e.g. to make a new vet appear before an escalation round.
pub struct StaticCandidateSource {
    candidates: Mutex<Vec<CandidateId>>,
    calls: AtomicU32,
}

impl StaticCandidateSource {
    pub fn new(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            candidates: Mutex::new(candidate_ids(ids)),
            calls: AtomicU32::new(0),
        })
    }

    pub fn set_candidates(&self, ids: &[&str]) {
        *self.lock() = candidate_ids(ids);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CandidateId>> {
        self.candidates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn find_eligible(
        &self,
        _city: &str,
        _species: &str,
        _exclude_unavailable: bool,
    ) -> Result<Vec<CandidateId>, SelectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().clone())
    }

    async fn find_escalated(
        &self,
        _case: &Case,
        _round: u32,
    ) -> Result<Vec<CandidateId>, SelectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().clone())
    }
}

/// Unreachable for the first `failures` calls, then answers like a static source.
pub struct UnavailableCandidateSource {
    failures_left: AtomicU32,
    calls: AtomicU32,
    candidates: Vec<CandidateId>,
}

impl UnavailableCandidateSource {
    pub fn failing(failures: u32, then: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            candidates: candidate_ids(then),
        })
    }

    pub fn forever() -> Arc<Self> {
        Self::failing(u32::MAX, &[])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandidateSource for UnavailableCandidateSource {
    async fn find_eligible(
        &self,
        _city: &str,
        _species: &str,
        _exclude_unavailable: bool,
    ) -> Result<Vec<CandidateId>, SelectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SelectionError::unavailable("roster service unreachable"));
        }
        Ok(self.candidates.clone())
    }
}

/// Everyone is reachable at `<id>@vets.test` unless listed as having no contact.
#[derive(Default)]
pub struct StaticDirectory {
    no_contact: HashSet<String>,
}

impl StaticDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without_contact(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            no_contact: ids.iter().map(|id| id.to_string()).collect(),
        })
    }

    pub fn address_of(candidate: &str) -> String {
        format!("{}@vets.test", candidate)
    }
}

#[async_trait]
impl CandidateDirectory for StaticDirectory {
    async fn contact(
        &self,
        candidate_id: &CandidateId,
    ) -> Result<Option<CandidateContact>, DbError> {
        if self.no_contact.contains(candidate_id.as_str()) {
            return Ok(None);
        }
        Ok(Some(CandidateContact {
            candidate_id: candidate_id.clone(),
            display_name: format!("Dr. {}", candidate_id),
            email: Self::address_of(candidate_id.as_str()),
        }))
    }
}
