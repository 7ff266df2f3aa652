//! Row types for every dispatch table.
//!
//! These are the shapes the engine, the binary and the operator tooling work
//! with. Timestamps are stored as milliseconds and surfaced as `DateTime<Utc>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vetdispatch_ids::{CandidateId, CaseId};
use vetdispatch_protocol::{
    ActionKind, CandidateStatus, CaseStatus, ConsultationKind, DeliveryStatus, MessageKind,
    RecipientType,
};

// ============================================================================
// Cases
// ============================================================================

/// Case payload written by the intake collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCase {
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    /// Full street address, only revealed to the assigned vet
    #[serde(default)]
    pub address: Option<String>,
    pub species: String,
    pub issue: String,
    #[serde(default)]
    pub is_emergency: bool,
    #[serde(default)]
    pub consultation_kind: ConsultationKind,
    pub owner_name: String,
    #[serde(default)]
    pub owner_email: Option<String>,
    #[serde(default)]
    pub owner_phone: Option<String>,
    /// Overrides the configured TTL for this case
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// A case (appointment) awaiting or holding an assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub city: String,
    pub state: Option<String>,
    pub address: Option<String>,
    pub species: String,
    pub issue: String,
    pub is_emergency: bool,
    pub consultation_kind: ConsultationKind,
    pub owner_name: String,
    pub owner_email: Option<String>,
    pub owner_phone: Option<String>,
    pub status: CaseStatus,
    /// Set exactly when `status` is ASSIGNED
    pub assigned_candidate_id: Option<CandidateId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// When the case was assigned, expired or cancelled
    pub closed_at: Option<DateTime<Utc>>,
    /// First successful selection + broadcast
    pub dispatched_at: Option<DateTime<Utc>>,
    pub dispatch_attempts: u32,
    pub last_dispatch_error: Option<String>,
    pub escalation_round: u32,
    /// Set when the case was handed to an operator
    pub escalated_at: Option<DateTime<Utc>>,
}

impl Case {
    pub fn is_open(&self) -> bool {
        self.status == CaseStatus::Open
    }

    /// City plus state when known, e.g. "Lahore, Punjab".
    pub fn location_label(&self) -> String {
        match self.state.as_deref().map(str::trim) {
            Some(state) if !state.is_empty() => format!("{}, {}", self.city, state),
            _ => self.city.clone(),
        }
    }
}

// ============================================================================
// Dispatch rows
// ============================================================================

/// One (case, candidate) dispatch row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCandidate {
    pub id: i64,
    pub case_id: CaseId,
    pub candidate_id: CandidateId,
    pub status: CandidateStatus,
    /// 0 for the initial broadcast, n for the n-th rebroadcast
    pub escalation_round: u32,
    pub notified_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Action tokens
// ============================================================================

/// What a token is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBinding {
    pub case_id: CaseId,
    pub candidate_id: CandidateId,
    pub action: ActionKind,
}

/// Stored action token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTokenRecord {
    pub token: String,
    pub case_id: CaseId,
    pub candidate_id: CandidateId,
    pub action: ActionKind,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ActionTokenRecord {
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    pub fn binding(&self) -> TokenBinding {
        TokenBinding {
            case_id: self.case_id.clone(),
            candidate_id: self.candidate_id.clone(),
            action: self.action,
        }
    }
}

// ============================================================================
// Delivery log
// ============================================================================

/// A delivery log row about to be written as PENDING.
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub case_id: CaseId,
    pub candidate_id: Option<CandidateId>,
    pub recipient_email: Option<String>,
    pub recipient_name: Option<String>,
    pub recipient_type: RecipientType,
    pub message_kind: MessageKind,
    pub subject: String,
}

/// One logged notification attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: i64,
    pub case_id: CaseId,
    pub candidate_id: Option<CandidateId>,
    pub recipient_email: Option<String>,
    pub recipient_name: Option<String>,
    pub recipient_type: RecipientType,
    pub message_kind: MessageKind,
    pub subject: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Filter for delivery log queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    pub case_id: Option<CaseId>,
    pub candidate_id: Option<CandidateId>,
    /// Exact, case-insensitive match on the recipient address
    pub recipient_email: Option<String>,
    pub message_kind: Option<MessageKind>,
    pub status: Option<DeliveryStatus>,
    pub limit: Option<u32>,
}

/// Number of log rows for one (message kind, status) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCount {
    pub message_kind: MessageKind,
    pub status: DeliveryStatus,
    pub count: u64,
}

// ============================================================================
// Roster
// ============================================================================

fn default_true() -> bool {
    true
}

/// A vet on the roster. Also the JSON shape accepted by `roster import`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub candidate_id: CandidateId,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub city: String,
    /// Species this vet covers; stored lowercase
    #[serde(default)]
    pub species: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_true")]
    pub available: bool,
}
