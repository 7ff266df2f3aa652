//! Vet dispatch engine.
//!
//! Routes a case to exactly one vet by broadcast-then-race: every eligible
//! vet gets accept/decline links at once, the first accept to commit wins,
//! and everyone else is told the case is gone.
//!
//! ```text
//! intake -> DispatchCoordinator -> CandidateSelector -> TokenVault
//!                               -> NotificationFanout (logged per recipient)
//! link click -> http -> ClaimResolver (one conditional write) -> NotificationFanout
//! ```

pub mod claim;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod http;
pub mod metrics;
pub mod roster;
pub mod selector;
pub mod sender;
pub mod templates;
pub mod token_vault;

pub use claim::ClaimResolver;
pub use coordinator::{
    CoordinatorConfig, DispatchCoordinator, DispatchReport, EscalationPolicy, Submission,
    SweepReport,
};
pub use error::{DispatchError, Result};
pub use fanout::{DeliveryOutcome, FanoutConfig, FanoutReport, NotificationFanout};
pub use metrics::METRICS;
pub use roster::RosterCandidateSource;
pub use selector::{
    CandidateContact, CandidateDirectory, CandidateSelector, CandidateSource, SelectionError,
};
pub use sender::{LogSender, NotificationSender, OutboundEmail, SendError, WebhookSender};
pub use templates::{MessageTemplates, RenderedMessage};
pub use token_vault::{TokenPair, TokenVault, VaultError};

use std::path::PathBuf;
use std::sync::Arc;
use vetdispatch_db::DispatchDb;
use vetdispatch_protocol::DispatchConfig;

/// The wired engine: one coordinator and one resolver sharing a store and a fan-out.
#[derive(Clone)]
pub struct DispatchEngine {
    pub db: DispatchDb,
    pub coordinator: DispatchCoordinator,
    pub resolver: ClaimResolver,
}

impl DispatchEngine {
    pub fn new(
        db: DispatchDb,
        config: &DispatchConfig,
        source: Arc<dyn CandidateSource>,
        directory: Arc<dyn CandidateDirectory>,
        sender: Arc<dyn NotificationSender>,
    ) -> Self {
        let fanout = NotificationFanout::new(
            db.clone(),
            sender,
            directory,
            MessageTemplates::new(config.public_base_url.clone()),
            FanoutConfig::from_config(config),
        );
        let coordinator_config = CoordinatorConfig::from_config(config);
        let resolver =
            ClaimResolver::new(db.clone(), fanout.clone(), coordinator_config.escalation);
        let coordinator = DispatchCoordinator::new(
            db.clone(),
            CandidateSelector::new(source),
            fanout,
            coordinator_config,
        );
        Self {
            db,
            coordinator,
            resolver,
        }
    }

    pub fn http_state(&self) -> http::AppState {
        http::AppState::new(self.resolver.clone())
    }
}

#[derive(clap::Parser, Debug)]
#[command(
    name = "vetdispatch",
    about = "Broadcast-then-race dispatch of vet cases"
)]
pub struct Cli {
    /// Config file (TOML); defaults apply when absent
    #[arg(long, env = "VETDISPATCH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path (overrides the config file)
    #[arg(long, env = "VETDISPATCH_DATABASE", global = true)]
    pub database: Option<PathBuf>,

    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run the respond endpoint and the periodic expiry sweep
    Serve {
        /// HTTP bind address (overrides the config file)
        #[arg(long, env = "VETDISPATCH_BIND")]
        bind: Option<String>,
    },
    /// Dispatch one OPEN case written by intake
    Dispatch {
        case_id: String,
    },
    /// Run one expiry sweep and exit
    Sweep,
    /// Cancel an OPEN case
    Cancel {
        case_id: String,
    },
    /// Query the email delivery log
    Deliveries {
        #[arg(long = "case")]
        case_id: Option<String>,

        /// initial-notification | acceptance-confirmation | case-taken | other
        #[arg(long)]
        kind: Option<String>,

        /// pending | sent | failed
        #[arg(long)]
        status: Option<String>,

        /// Recipient email (case-insensitive)
        #[arg(long)]
        recipient: Option<String>,

        #[arg(short = 'n', long, default_value = "50")]
        limit: u32,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the vet roster
    Roster {
        #[command(subcommand)]
        action: RosterAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum RosterAction {
    /// Upsert roster entries from a JSON array file
    Import { file: PathBuf },
    /// Mark a vet available or unavailable
    SetAvailable {
        candidate_id: String,
        #[arg(action = clap::ArgAction::Set)]
        available: bool,
    },
}
