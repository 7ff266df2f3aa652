//! Notification fan-out.
//!
//! Each recipient is an independent unit of work: a PENDING log row, then up
//! to `max_attempts` sends under a timeout, then SENT or FAILED. Sends run on
//! a bounded pool; one recipient failing never affects another, and nothing
//! here can fail the caller.

use crate::metrics::METRICS;
use crate::selector::{CandidateContact, CandidateDirectory};
use crate::sender::{NotificationSender, OutboundEmail, SendError};
use crate::templates::{MessageTemplates, RenderedMessage};
use crate::token_vault::TokenPair;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use vetdispatch_db::{Case, DispatchDb, NewDelivery};
use vetdispatch_ids::CandidateId;
use vetdispatch_protocol::defaults::NO_CONTACT_ON_FILE;
use vetdispatch_protocol::{DispatchConfig, MessageKind, RecipientType};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub concurrency: usize,
    pub send_timeout: Duration,
    /// Attempts per recipient, including the first
    pub max_attempts: u32,
    pub retry_base: Duration,
}

impl FanoutConfig {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            concurrency: config.fanout_concurrency.max(1),
            send_timeout: config.send_timeout(),
            max_attempts: config.send_max_attempts.max(1),
            retry_base: Duration::from_millis(config.send_retry_base_ms),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { attempts: u32 },
    Failed { attempts: u32, error: String },
    /// No address on file; logged as FAILED without a send
    NoContact,
}

#[derive(Debug, Clone)]
pub struct RecipientResult {
    pub candidate_id: Option<CandidateId>,
    /// Delivery log row, absent only if the log itself could not be written
    pub log_id: Option<i64>,
    pub outcome: DeliveryOutcome,
}

impl RecipientResult {
    pub fn is_sent(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Sent { .. })
    }
}

/// Aggregate of one fan-out call.
#[derive(Debug, Clone, Default)]
pub struct FanoutReport {
    pub results: Vec<RecipientResult>,
}

impl FanoutReport {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn sent(&self) -> usize {
        self.results.iter().filter(|r| r.is_sent()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.sent()
    }
}

/// A message addressed to one recipient (or to nobody, if no contact is on file).
struct DeliveryJob {
    delivery: NewDelivery,
    email: Option<OutboundEmail>,
}

#[derive(Clone)]
pub struct NotificationFanout {
    db: DispatchDb,
    sender: Arc<dyn NotificationSender>,
    directory: Arc<dyn CandidateDirectory>,
    templates: Arc<MessageTemplates>,
    config: FanoutConfig,
    permits: Arc<Semaphore>,
}

impl NotificationFanout {
    pub fn new(
        db: DispatchDb,
        sender: Arc<dyn NotificationSender>,
        directory: Arc<dyn CandidateDirectory>,
        templates: MessageTemplates,
        config: FanoutConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            db,
            sender,
            directory,
            templates: Arc::new(templates),
            config,
            permits,
        }
    }

    pub fn templates(&self) -> &MessageTemplates {
        &self.templates
    }

    /// Send the new-case message with each candidate's own accept/decline links.
    pub async fn broadcast_new(
        &self,
        case: &Case,
        candidates: &[CandidateId],
        tokens: &HashMap<CandidateId, TokenPair>,
    ) -> FanoutReport {
        let mut jobs = Vec::with_capacity(candidates.len());
        for candidate_id in candidates {
            let contact = self.resolve(candidate_id).await;
            let pair = tokens.get(candidate_id);
            let (subject, email) = match (&contact, pair) {
                (Some(contact), Some(pair)) => {
                    let msg = self.templates.new_case(
                        case,
                        &contact.display_name,
                        &pair.accept,
                        &pair.decline,
                    );
                    (msg.subject.clone(), Some(address(contact, msg)))
                }
                (_, None) => {
                    error!(case_id = %case.id, candidate_id = %candidate_id, "No action tokens for candidate; not notifying");
                    continue;
                }
                (None, Some(_)) => (
                    format!("New {} case in {}", case.species, case.city),
                    None,
                ),
            };
            jobs.push(candidate_job(
                case,
                candidate_id,
                contact.as_ref(),
                MessageKind::InitialNotification,
                subject,
                email,
            ));
        }

        let report = self.deliver_all(jobs).await;
        info!(
            case_id = %case.id,
            recipients = report.len(),
            sent = report.sent(),
            failed = report.failed(),
            "New case broadcast"
        );
        report
    }

    /// Full-detail confirmation to the winner only.
    pub async fn announce_assigned(&self, case: &Case, winner: &CandidateId) -> FanoutReport {
        let contact = self.resolve(winner).await;
        let (subject, email) = match &contact {
            Some(contact) => {
                let msg = self
                    .templates
                    .acceptance_confirmation(case, &contact.display_name);
                (msg.subject.clone(), Some(address(contact, msg)))
            }
            None => (format!("Case assigned to you: {}", case.species), None),
        };

        let job = candidate_job(
            case,
            winner,
            contact.as_ref(),
            MessageKind::AcceptanceConfirmation,
            subject,
            email,
        );
        self.deliver_all(vec![job]).await
    }

    /// "Case taken" to every loser it is given, one log row each.
    pub async fn announce_lost(&self, case: &Case, losers: &[CandidateId]) -> FanoutReport {
        let mut jobs = Vec::with_capacity(losers.len());
        for loser in losers {
            let contact = self.resolve(loser).await;
            let (subject, email) = match &contact {
                Some(contact) => {
                    let msg = self.templates.case_taken(case, &contact.display_name);
                    (msg.subject.clone(), Some(address(contact, msg)))
                }
                None => (format!("Case taken: {} in {}", case.species, case.city), None),
            };
            jobs.push(candidate_job(
                case,
                loser,
                contact.as_ref(),
                MessageKind::CaseTaken,
                subject,
                email,
            ));
        }

        let report = self.deliver_all(jobs).await;
        debug!(case_id = %case.id, losers = report.len(), sent = report.sent(), "Case-taken notices sent");
        report
    }

    /// Notice to the case owner (`MessageKind::Other`).
    pub async fn notify_owner(&self, case: &Case, msg: RenderedMessage) -> FanoutReport {
        let owner_email = case
            .owner_email
            .as_deref()
            .map(str::trim)
            .filter(|e| e.contains('@'))
            .map(str::to_string);

        let delivery = NewDelivery {
            case_id: case.id.clone(),
            candidate_id: None,
            recipient_email: owner_email.clone(),
            recipient_name: Some(case.owner_name.clone()),
            recipient_type: RecipientType::CaseOwner,
            message_kind: MessageKind::Other,
            subject: msg.subject.clone(),
        };
        let email = owner_email.map(|to| OutboundEmail {
            to,
            to_name: Some(case.owner_name.clone()),
            subject: msg.subject,
            html_body: msg.html_body,
            text_body: msg.text_body,
        });

        self.deliver_all(vec![DeliveryJob { delivery, email }]).await
    }

    /// Name to show an owner; falls back to the candidate id.
    pub async fn display_name(&self, candidate_id: &CandidateId) -> String {
        self.resolve(candidate_id)
            .await
            .map(|c| c.display_name)
            .unwrap_or_else(|| candidate_id.to_string())
    }

    async fn resolve(&self, candidate_id: &CandidateId) -> Option<CandidateContact> {
        match self.directory.contact(candidate_id).await {
            Ok(contact) => contact,
            Err(err) => {
                METRICS.inc_db_errors();
                warn!(candidate_id = %candidate_id, error = %err, "Contact lookup failed");
                None
            }
        }
    }

    async fn deliver_all(&self, jobs: Vec<DeliveryJob>) -> FanoutReport {
        let mut set = JoinSet::new();
        for job in jobs {
            let db = self.db.clone();
            let sender = Arc::clone(&self.sender);
            let permits = Arc::clone(&self.permits);
            let config = self.config.clone();
            set.spawn(async move {
                // The semaphore is never closed, so acquire only fails after shutdown.
                let _permit = permits.acquire_owned().await.ok();
                deliver_one(&db, sender.as_ref(), &config, job).await
            });
        }

        let mut report = FanoutReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => report.results.push(result),
                Err(err) => error!(error = %err, "Delivery task panicked"),
            }
        }
        report
    }
}

fn address(contact: &CandidateContact, msg: RenderedMessage) -> OutboundEmail {
    OutboundEmail {
        to: contact.email.clone(),
        to_name: Some(contact.display_name.clone()),
        subject: msg.subject,
        html_body: msg.html_body,
        text_body: msg.text_body,
    }
}

fn candidate_job(
    case: &Case,
    candidate_id: &CandidateId,
    contact: Option<&CandidateContact>,
    kind: MessageKind,
    subject: String,
    email: Option<OutboundEmail>,
) -> DeliveryJob {
    DeliveryJob {
        delivery: NewDelivery {
            case_id: case.id.clone(),
            candidate_id: Some(candidate_id.clone()),
            recipient_email: contact.map(|c| c.email.clone()),
            recipient_name: contact.map(|c| c.display_name.clone()),
            recipient_type: RecipientType::Candidate,
            message_kind: kind,
            subject,
        },
        email,
    }
}

async fn deliver_one(
    db: &DispatchDb,
    sender: &dyn NotificationSender,
    config: &FanoutConfig,
    job: DeliveryJob,
) -> RecipientResult {
    let candidate_id = job.delivery.candidate_id.clone();

    let log_id = match db.log_pending(&job.delivery).await {
        Ok(id) => id,
        Err(err) => {
            // No audit row means no send.
            METRICS.inc_db_errors();
            METRICS.inc_sends_failed();
            error!(case_id = %job.delivery.case_id, error = %err, "Failed to write delivery log row");
            return RecipientResult {
                candidate_id,
                log_id: None,
                outcome: DeliveryOutcome::Failed {
                    attempts: 0,
                    error: format!("delivery log unavailable: {}", err),
                },
            };
        }
    };

    let Some(email) = job.email else {
        METRICS.inc_sends_failed();
        warn!(
            case_id = %job.delivery.case_id,
            kind = %job.delivery.message_kind,
            "No contact on file; delivery marked failed"
        );
        finalize_failed(db, log_id, 0, NO_CONTACT_ON_FILE).await;
        return RecipientResult {
            candidate_id,
            log_id: Some(log_id),
            outcome: DeliveryOutcome::NoContact,
        };
    };

    let mut attempt = 0;
    let outcome = loop {
        attempt += 1;
        let result = match tokio::time::timeout(config.send_timeout, sender.send(&email)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(config.send_timeout)),
        };

        match result {
            Ok(()) => {
                METRICS.inc_sends_ok();
                if let Err(err) = db.mark_sent(log_id, attempt).await {
                    METRICS.inc_db_errors();
                    error!(log_id, error = %err, "Failed to mark delivery sent");
                }
                break DeliveryOutcome::Sent { attempts: attempt };
            }
            Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                METRICS.inc_send_retries();
                let delay = retry_delay(config.retry_base, attempt);
                debug!(log_id, attempt, error = %err, delay_ms = delay.as_millis() as u64, "Send failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                METRICS.inc_sends_failed();
                warn!(log_id, attempt, to = %email.to, error = %err, "Send failed");
                let detail = err.to_string();
                finalize_failed(db, log_id, attempt, &detail).await;
                break DeliveryOutcome::Failed {
                    attempts: attempt,
                    error: detail,
                };
            }
        }
    };

    RecipientResult {
        candidate_id,
        log_id: Some(log_id),
        outcome,
    }
}

async fn finalize_failed(db: &DispatchDb, log_id: i64, attempts: u32, detail: &str) {
    if let Err(err) = db.mark_failed(log_id, attempts, detail).await {
        METRICS.inc_db_errors();
        error!(log_id, error = %err, "Failed to mark delivery failed");
    }
}

/// Exponential backoff with up to 50% jitter: base, 2x base, 4x base, ...
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(1u64 << exponent);
    let jitter_ms = if base_ms > 1 {
        rand::thread_rng().gen_range(0..=base_ms / 2)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter_ms)).min(MAX_RETRY_DELAY)
}
