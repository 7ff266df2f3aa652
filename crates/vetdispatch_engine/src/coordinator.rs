//! Dispatch coordinator: selection, token issuance, broadcast, and the
//! expiry sweep.
//!
//! Dispatch is idempotent. Candidate rows are insert-or-ignore, tokens are
//! reused, and only candidates without a SENT initial notification are
//! (re)sent, so a crashed or retried dispatch converges instead of doubling
//! up links or messages.

use crate::error::{DispatchError, Result};
use crate::fanout::{FanoutReport, NotificationFanout};
use crate::metrics::METRICS;
use crate::selector::CandidateSelector;
use crate::token_vault::{TokenPair, TokenVault, VaultError};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vetdispatch_db::{Case, DbError, DispatchDb, NewCase};
use vetdispatch_ids::{CandidateId, CaseId};
use vetdispatch_protocol::{CandidateStatus, DispatchConfig, EscalationMode, MessageKind};

/// Cases handled per sweep pass, per category.
const SWEEP_BATCH: u32 = 100;

/// What to do with an OPEN case whose deadline passed without an accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationPolicy {
    Expire,
    Rebroadcast { max_rounds: u32 },
    OperatorReview,
}

impl EscalationPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        match config.escalation {
            EscalationMode::Expire => EscalationPolicy::Expire,
            EscalationMode::Rebroadcast => EscalationPolicy::Rebroadcast {
                max_rounds: config.escalation_max_rounds,
            },
            EscalationMode::OperatorReview => EscalationPolicy::OperatorReview,
        }
    }

    /// Whether a due case may still get another round instead of expiring.
    pub fn may_extend(&self, case: &Case) -> bool {
        match self {
            EscalationPolicy::Rebroadcast { max_rounds } => case.escalation_round < *max_rounds,
            EscalationPolicy::Expire | EscalationPolicy::OperatorReview => false,
        }
    }

    /// Whether expiry hands the case to an operator.
    pub fn flags_operator(&self) -> bool {
        matches!(self, EscalationPolicy::OperatorReview)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub case_ttl: Duration,
    pub emergency_case_ttl: Duration,
    pub selection_max_attempts: u32,
    pub selection_backoff_base: Duration,
    pub selection_backoff_max: Duration,
    pub escalation: EscalationPolicy,
    pub sweep_interval: Duration,
}

impl CoordinatorConfig {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            case_ttl: config.case_ttl(false),
            emergency_case_ttl: config.case_ttl(true),
            selection_max_attempts: config.selection_max_attempts.max(1),
            selection_backoff_base: Duration::from_millis(config.selection_backoff_base_ms),
            selection_backoff_max: Duration::from_millis(config.selection_backoff_max_ms),
            escalation: EscalationPolicy::from_config(config),
            sweep_interval: config.sweep_interval(),
        }
    }

    fn ttl_for(&self, is_emergency: bool) -> Duration {
        if is_emergency {
            self.emergency_case_ttl
        } else {
            self.case_ttl
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// Result of one dispatch pass over a case.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Candidates returned by selection
    pub selected: usize,
    /// Dispatch rows created by this pass
    pub new_rows: usize,
    pub broadcast: FanoutReport,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub case: Case,
    /// `None` when selection failed; the sweep retries the case.
    pub dispatch: Option<DispatchReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub redispatched: usize,
    pub expired: usize,
    pub escalated: usize,
    pub flagged: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }
}

#[derive(Clone)]
pub struct DispatchCoordinator {
    db: DispatchDb,
    selector: CandidateSelector,
    fanout: NotificationFanout,
    config: CoordinatorConfig,
}

impl DispatchCoordinator {
    pub fn new(
        db: DispatchDb,
        selector: CandidateSelector,
        fanout: NotificationFanout,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            db,
            selector,
            fanout,
            config,
        }
    }

    /// Record a case from intake and dispatch it.
    ///
    /// A selection failure is not an error here: the case is kept OPEN with
    /// the failure recorded and the sweep tries again.
    pub async fn submit_case(&self, new_case: NewCase) -> Result<Submission> {
        let ttl = new_case
            .ttl_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.ttl_for(new_case.is_emergency));
        let case = self.db.insert_case(&new_case, ttl).await?;
        info!(
            case_id = %case.id,
            city = %case.city,
            species = %case.species,
            emergency = case.is_emergency,
            "Case submitted"
        );

        let dispatch = match self.dispatch_case(&case.id).await {
            Ok(report) => Some(report),
            Err(DispatchError::Selection(err)) => {
                warn!(case_id = %case.id, error = %err, "Dispatch deferred to sweep");
                None
            }
            Err(err) => return Err(err),
        };
        Ok(Submission { case, dispatch })
    }

    /// Select candidates, create their rows and tokens, broadcast.
    pub async fn dispatch_case(&self, case_id: &CaseId) -> Result<DispatchReport> {
        let case = self
            .db
            .get_case(case_id)
            .await?
            .ok_or_else(|| DispatchError::CaseNotFound(case_id.clone()))?;
        if !case.is_open() {
            debug!(case_id = %case_id, status = %case.status, "Case no longer open; not dispatching");
            return Ok(DispatchReport::default());
        }

        let candidates = self.select_with_retry(&case).await?;
        if candidates.is_empty() {
            warn!(case_id = %case_id, city = %case.city, species = %case.species, "No eligible candidates");
        }

        let (new_rows, tokens) = self
            .record_candidates(&case, &candidates, case.escalation_round, None)
            .await?
            .unwrap_or_default();

        let delivered = self
            .db
            .delivered_candidates(case_id, MessageKind::InitialNotification)
            .await?;
        let recipients: Vec<CandidateId> = candidates
            .iter()
            .filter(|c| tokens.contains_key(*c) && !delivered.contains(*c))
            .cloned()
            .collect();

        let broadcast = self.fanout.broadcast_new(&case, &recipients, &tokens).await;

        METRICS.inc_cases_dispatched();
        METRICS.add_candidates_notified(new_rows as u64);
        info!(
            case_id = %case_id,
            selected = candidates.len(),
            new_rows,
            sent = broadcast.sent(),
            "Case dispatched"
        );

        Ok(DispatchReport {
            selected: candidates.len(),
            new_rows,
            broadcast,
        })
    }

    /// OPEN -> CANCELLED. Returns false if the case had already left OPEN.
    pub async fn cancel_case(&self, case_id: &CaseId) -> Result<bool> {
        if self
            .db
            .cancel_open_case(case_id, DispatchDb::now_millis())
            .await?
        {
            METRICS.inc_cases_cancelled();
            info!(case_id = %case_id, "Case cancelled");
            return Ok(true);
        }

        match self.db.get_case(case_id).await? {
            Some(case) => {
                debug!(case_id = %case_id, status = %case.status, "Cancel ignored; case not open");
                Ok(false)
            }
            None => Err(DispatchError::CaseNotFound(case_id.clone())),
        }
    }

    /// One sweep pass: retry undispatched cases, then apply the escalation
    /// policy to every OPEN case past its deadline.
    pub async fn sweep_expired(&self, now_millis: i64) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for case in self
            .db
            .list_undispatched_cases(now_millis, SWEEP_BATCH)
            .await?
        {
            match self.dispatch_case(&case.id).await {
                Ok(_) => report.redispatched += 1,
                Err(err) => {
                    report.errors += 1;
                    warn!(case_id = %case.id, error = %err, "Dispatch retry failed");
                }
            }
        }

        for case in self.db.list_due_open_cases(now_millis, SWEEP_BATCH).await? {
            if let Err(err) = self.handle_due(&case, now_millis, &mut report).await {
                report.errors += 1;
                error!(case_id = %case.id, error = %err, "Failed to close out expired case");
            }
        }

        if !report.is_idle() {
            info!(
                redispatched = report.redispatched,
                expired = report.expired,
                escalated = report.escalated,
                flagged = report.flagged,
                errors = report.errors,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `sweep_interval` until `shutdown` flips to true.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.sweep_interval.as_secs(), "Expiry sweep started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(err) = self.sweep_expired(DispatchDb::now_millis()).await {
                METRICS.inc_db_errors();
                warn!(error = %err, "Sweep failed");
            }
            debug!("{}", METRICS.snapshot().summary());

            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Expiry sweep stopped");
    }

    async fn handle_due(&self, case: &Case, now: i64, report: &mut SweepReport) -> Result<()> {
        match self.config.escalation {
            EscalationPolicy::Expire => {
                if self.expire(case, now, false).await? {
                    report.expired += 1;
                }
            }
            EscalationPolicy::OperatorReview => {
                if self.expire(case, now, true).await? {
                    report.expired += 1;
                    report.flagged += 1;
                    warn!(case_id = %case.id, "Case expired without an accept; flagged for operator review");
                }
            }
            EscalationPolicy::Rebroadcast { .. } => {
                if !self.config.escalation.may_extend(case) {
                    if self.expire(case, now, false).await? {
                        report.expired += 1;
                    }
                    return Ok(());
                }

                match self.rebroadcast(case, now).await {
                    Ok(Some(_)) => report.escalated += 1,
                    Ok(None) => {
                        if self.expire(case, now, false).await? {
                            report.expired += 1;
                        }
                    }
                    Err(DispatchError::Selection(err)) => {
                        // Still OPEN and due; the next tick asks again.
                        self.db
                            .record_dispatch_failure(&case.id, &err.to_string())
                            .await?;
                        report.errors += 1;
                        warn!(case_id = %case.id, error = %err, "Escalation selection failed");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Conditional OPEN -> EXPIRED plus the owner notice.
    async fn expire(&self, case: &Case, now: i64, flag_for_operator: bool) -> Result<bool> {
        if !self
            .db
            .expire_open_case(&case.id, now, flag_for_operator)
            .await?
        {
            debug!(case_id = %case.id, "Case left OPEN before expiry");
            return Ok(false);
        }

        METRICS.inc_cases_expired();
        if flag_for_operator {
            METRICS.inc_cases_escalated();
        }
        info!(case_id = %case.id, "Case expired");

        let notice = self.fanout.templates().owner_expired(case);
        self.fanout.notify_owner(case, notice).await;
        Ok(true)
    }

    /// Notify candidates not yet on the case and push the deadline.
    ///
    /// `Ok(None)` when there is nobody new to ask or another sweeper already
    /// escalated this round.
    async fn rebroadcast(&self, case: &Case, now: i64) -> Result<Option<FanoutReport>> {
        let round = case.escalation_round + 1;
        let selected = self.selector.select_escalated(case, round).await?;

        let existing: HashSet<CandidateId> = self
            .db
            .list_dispatch_candidates(&case.id)
            .await?
            .into_iter()
            .map(|row| row.candidate_id)
            .collect();
        let newcomers: Vec<CandidateId> = selected
            .into_iter()
            .filter(|c| !existing.contains(c))
            .collect();
        if newcomers.is_empty() {
            debug!(case_id = %case.id, round, "No new candidates for escalation");
            return Ok(None);
        }

        let ttl_ms = self.config.ttl_for(case.is_emergency).as_millis() as i64;
        let extension = Extension {
            expected_round: case.escalation_round,
            new_expires_at: now + ttl_ms,
        };
        let Some((new_rows, tokens)) = self
            .record_candidates(case, &newcomers, round, Some(extension))
            .await?
        else {
            return Ok(None);
        };

        let case = self
            .db
            .get_case(&case.id)
            .await?
            .ok_or_else(|| DispatchError::CaseNotFound(case.id.clone()))?;
        let broadcast = self.fanout.broadcast_new(&case, &newcomers, &tokens).await;

        METRICS.inc_cases_escalated();
        METRICS.add_candidates_notified(new_rows as u64);
        info!(
            case_id = %case.id,
            round,
            newcomers = newcomers.len(),
            sent = broadcast.sent(),
            "Case rebroadcast"
        );
        Ok(Some(broadcast))
    }

    async fn select_with_retry(&self, case: &Case) -> Result<Vec<CandidateId>> {
        let max_attempts = self.config.selection_max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.selector.select(case).await {
                Ok(candidates) => return Ok(candidates),
                Err(err) if attempt < max_attempts => {
                    METRICS.inc_selection_retries();
                    let delay = self.selection_backoff(attempt);
                    warn!(
                        case_id = %case.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Candidate selection failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(case_id = %case.id, attempts = attempt, error = %err, "Candidate selection failed");
                    self.db
                        .record_dispatch_failure(&case.id, &err.to_string())
                        .await?;
                    return Err(err.into());
                }
            }
        }
    }

    fn selection_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.selection_backoff_base.as_millis() as u64;
        let cap = self.config.selection_backoff_max.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let jitter = if base > 1 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter).min(cap))
    }

    /// One transaction: optional deadline extension first, then a row and a
    /// token pair per candidate, then the dispatch stamp.
    ///
    /// Returns the number of new rows and tokens for every candidate still
    /// NOTIFIED on the case, or `None` if the extension lost its
    /// compare-and-set to another sweeper.
    async fn record_candidates(
        &self,
        case: &Case,
        candidates: &[CandidateId],
        round: u32,
        extension: Option<Extension>,
    ) -> Result<Option<(usize, HashMap<CandidateId, TokenPair>)>> {
        let now = DispatchDb::now_millis();
        let mut tx = self.db.begin().await?;

        if let Some(ext) = extension {
            if !DispatchDb::extend_open_case_in(
                &mut tx,
                &case.id,
                ext.expected_round,
                ext.new_expires_at,
            )
            .await?
            {
                tx.rollback().await.map_err(DbError::from)?;
                debug!(case_id = %case.id, "Escalation already handled elsewhere");
                return Ok(None);
            }
        } else {
            // Write first, so the transaction holds the lock before it reads.
            DispatchDb::record_dispatch_success_in(&mut tx, &case.id, now).await?;
        }

        let mut new_rows = 0;
        let mut tokens = HashMap::new();
        for candidate_id in candidates {
            if DispatchDb::insert_candidate_in(&mut tx, &case.id, candidate_id, round, now).await? {
                new_rows += 1;
            }
            let row = DispatchDb::get_dispatch_candidate_in(&mut tx, &case.id, candidate_id).await?;
            if !matches!(row, Some(ref r) if r.status == CandidateStatus::Notified) {
                continue;
            }
            let pair = TokenVault::issue_pair_in(&mut tx, &case.id, candidate_id)
                .await
                .map_err(vault_error)?;
            tokens.insert(candidate_id.clone(), pair);
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(Some((new_rows, tokens)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Extension {
    expected_round: u32,
    new_expires_at: i64,
}

fn vault_error(err: VaultError) -> DispatchError {
    match err {
        VaultError::Db(err) => DispatchError::Db(err),
        other => DispatchError::invariant(other.to_string()),
    }
}
