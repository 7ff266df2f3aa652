//! vetdispatch test utilities
//!
//! Fixtures for driving the engine end to end without a network: file-backed
//! SQLite databases in a temp dir, senders that record or fail on purpose,
//! and candidate sources whose answers the test controls.
//!
//! # Usage
//!
//! ```rust,ignore
//! use vetdispatch_test_utils::{TestDb, RecordingSender, StaticCandidateSource, StaticDirectory};
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn test_dispatch() {
//!     let db = TestDb::new().await.unwrap();
//!     let sender = RecordingSender::new();
//!     let source = StaticCandidateSource::new(&["v1", "v2"]);
//!     let engine = test_engine(&db, &test_config(), source, StaticDirectory::new(), sender.clone());
//!     // ...
//!     // The database file is removed when `db` goes out of scope
//! }
//! ```

pub mod db;
pub mod fixtures;
pub mod senders;
pub mod sources;

// Re-exports for convenience
pub use db::TestDb;
pub use fixtures::{candidate_ids, lahore_cow, test_config, test_engine};
pub use senders::{FailingSender, FailureMode, RecordingSender};
pub use sources::{StaticCandidateSource, StaticDirectory, UnavailableCandidateSource};
