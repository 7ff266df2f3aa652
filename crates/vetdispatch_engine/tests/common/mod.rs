//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use vetdispatch_db::{DeliveryFilter, DeliveryLogEntry, DispatchDb};
use vetdispatch_ids::{CandidateId, CaseId};
use vetdispatch_protocol::{ActionKind, MessageKind};

pub fn cand(id: &str) -> CandidateId {
    CandidateId::parse(id).unwrap()
}

/// The token embedded in a candidate's link for `action`.
pub async fn token(db: &DispatchDb, case_id: &CaseId, candidate: &str, action: ActionKind) -> String {
    db.get_token_for(case_id, &cand(candidate), action)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("no {action} token for {candidate}"))
        .token
}

pub async fn deliveries(db: &DispatchDb, case_id: &CaseId, kind: MessageKind) -> Vec<DeliveryLogEntry> {
    db.list_deliveries(&DeliveryFilter {
        case_id: Some(case_id.clone()),
        message_kind: Some(kind),
        ..Default::default()
    })
    .await
    .unwrap()
}
