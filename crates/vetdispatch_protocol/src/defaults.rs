//! Canonical default values shared by the store, the engine and the binary.

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8087";
pub const DEFAULT_PUBLIC_BASE_URL: &str = "http://127.0.0.1:8087";
pub const DEFAULT_DATABASE_FILE: &str = "vetdispatch.sqlite3";
pub const HOME_ENV_VAR: &str = "VETDISPATCH_HOME";
pub const HOME_DIR_NAME: &str = ".vetdispatch";

/// Ordinary cases stay open for thirty minutes.
pub const DEFAULT_CASE_TTL_SECS: u64 = 1_800;
/// Emergencies are escalated sooner.
pub const DEFAULT_EMERGENCY_CASE_TTL_SECS: u64 = 600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_FANOUT_CONCURRENCY: usize = 8;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SEND_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_SEND_RETRY_BASE_MS: u64 = 250;

pub const DEFAULT_SELECTION_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_SELECTION_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_SELECTION_BACKOFF_MAX_MS: u64 = 8_000;

pub const DEFAULT_ESCALATION_MAX_ROUNDS: u32 = 1;

/// Error detail recorded when a candidate has no reachable address.
pub const NO_CONTACT_ON_FILE: &str = "no contact on file";
