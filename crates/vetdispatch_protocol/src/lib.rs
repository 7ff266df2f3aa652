//! Shared vocabulary for the vetdispatch engine.
//!
//! Every status string that touches the database, a URL or a log line is
//! defined here exactly once. The store, the engine and the binary all parse
//! at the boundary through these types.

pub mod config;
pub mod defaults;
pub mod types;

pub use config::{vetdispatch_home, ConfigError, DispatchConfig, EscalationMode, SenderKind};
pub use types::{
    ActionKind, CandidateStatus, CaseStatus, ConsultationKind, DeliveryStatus, MessageKind,
    RecipientType, ResponseOutcome,
};
