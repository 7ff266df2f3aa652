//! Case and config fixtures.

use crate::db::TestDb;
use std::sync::Arc;
use vetdispatch_db::NewCase;
use vetdispatch_engine::{CandidateDirectory, CandidateSource, DispatchEngine, NotificationSender};
use vetdispatch_ids::CandidateId;
use vetdispatch_protocol::{ConsultationKind, DispatchConfig};

/// A non-emergency cow case in Lahore with full owner details.
pub fn lahore_cow() -> NewCase {
    NewCase {
        city: "Lahore".to_string(),
        state: Some("Punjab".to_string()),
        address: Some("12 Canal Road".to_string()),
        species: "Cow".to_string(),
        issue: "Not eating since yesterday, mild fever".to_string(),
        is_emergency: false,
        consultation_kind: ConsultationKind::Physical,
        owner_name: "Ayesha Khan".to_string(),
        owner_email: Some("ayesha@owners.test".to_string()),
        owner_phone: Some("+92 300 0000000".to_string()),
        ttl_secs: None,
    }
}

/// Defaults with millisecond-scale retries so failure paths run fast.
pub fn test_config() -> DispatchConfig {
    DispatchConfig {
        public_base_url: "http://dispatch.test".to_string(),
        send_timeout_ms: 500,
        send_max_attempts: 3,
        send_retry_base_ms: 1,
        selection_max_attempts: 3,
        selection_backoff_base_ms: 1,
        selection_backoff_max_ms: 5,
        ..DispatchConfig::default()
    }
}

pub fn candidate_ids(ids: &[&str]) -> Vec<CandidateId> {
    ids.iter()
        .map(|id| CandidateId::parse(id).unwrap_or_else(|e| panic!("bad candidate id {id}: {e}")))
        .collect()
}

pub fn test_engine(
    db: &TestDb,
    config: &DispatchConfig,
    source: Arc<dyn CandidateSource>,
    directory: Arc<dyn CandidateDirectory>,
    sender: Arc<dyn NotificationSender>,
) -> DispatchEngine {
    DispatchEngine::new(db.db(), config, source, directory, sender)
}
