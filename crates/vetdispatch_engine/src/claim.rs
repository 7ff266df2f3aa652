//! Claim resolution: the race-safe accept/decline state machine.
//!
//! Every redemption runs in one SQLite transaction that opens with the token
//! consumption write. The claim itself is `UPDATE dispatch_cases ... WHERE
//! status = 'OPEN'`; whichever transaction commits that write first wins,
//! and everyone else reads a terminal case and gets an informational outcome.
//!
//! The claim also requires `expires_at > now`, so an accept that arrives
//! after the deadline loses even if no sweep has run yet.
//!
//! Notifications go out after commit on tasks owned by the resolver, not by
//! the request. A dropped request never cancels them.

use crate::coordinator::EscalationPolicy;
use crate::error::{DispatchError, Result};
use crate::fanout::NotificationFanout;
use crate::metrics::METRICS;
use crate::token_vault::{TokenVault, VaultError};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vetdispatch_db::{Case, DbError, DbTransaction, DispatchDb, TokenBinding};
use vetdispatch_ids::{CandidateId, CaseId};
use vetdispatch_protocol::{ActionKind, CandidateStatus, CaseStatus, ResponseOutcome};

#[derive(Clone)]
pub struct ClaimResolver {
    db: DispatchDb,
    vault: TokenVault,
    fanout: NotificationFanout,
    escalation: EscalationPolicy,
    announcements: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ClaimResolver {
    pub fn new(db: DispatchDb, fanout: NotificationFanout, escalation: EscalationPolicy) -> Self {
        let vault = TokenVault::new(db.clone());
        Self {
            db,
            vault,
            fanout,
            escalation,
            announcements: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Wait for every post-commit announcement spawned so far.
    pub async fn wait_for_announcements(&self) {
        let pending = std::mem::take(&mut *self.lock_announcements());
        for handle in pending {
            if let Err(err) = handle.await {
                error!(error = %err, "Announcement task failed");
            }
        }
    }

    fn lock_announcements(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.announcements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_announcement(&self, task: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        let mut pending = self.lock_announcements();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    pub async fn accept_via_token(&self, token: &str) -> Result<ResponseOutcome> {
        self.resolve(None, token, ActionKind::Accept).await
    }

    pub async fn decline_via_token(&self, token: &str) -> Result<ResponseOutcome> {
        self.resolve(None, token, ActionKind::Decline).await
    }

    /// Handle a respond link. A token that belongs to another case, or to the
    /// other action, is an invalid link and is left unconsumed.
    pub async fn respond(
        &self,
        case_id: &CaseId,
        token: &str,
        action: ActionKind,
    ) -> Result<ResponseOutcome> {
        self.resolve(Some(case_id), token, action).await
    }

    async fn resolve(
        &self,
        expected_case: Option<&CaseId>,
        token: &str,
        action: ActionKind,
    ) -> Result<ResponseOutcome> {
        if let Some(expected) = expected_case {
            let record = self.vault.lookup(token).await.map_err(vault_to_dispatch)?;
            match record {
                Some(record) if &record.case_id == expected => {}
                Some(record) => {
                    METRICS.inc_tokens_invalid();
                    warn!(
                        case_id = %expected,
                        token_case_id = %record.case_id,
                        "Respond link token belongs to another case"
                    );
                    return Ok(ResponseOutcome::InvalidLink);
                }
                None => {
                    METRICS.inc_tokens_invalid();
                    debug!(case_id = %expected, "Unknown respond token");
                    return Ok(ResponseOutcome::InvalidLink);
                }
            }
        }

        let mut tx = self.db.begin().await?;
        let binding = match TokenVault::redeem_in(&mut tx, token, action).await {
            Ok(binding) => binding,
            Err(VaultError::TokenAlreadyConsumed(binding)) => {
                let outcome = replay_outcome(&mut tx, &binding).await;
                tx.rollback().await.map_err(DbError::from)?;
                return outcome;
            }
            Err(VaultError::Db(err)) => return Err(err.into()),
            Err(err) => {
                tx.rollback().await.map_err(DbError::from)?;
                METRICS.inc_tokens_invalid();
                debug!(error = %err, "Token rejected");
                return Ok(ResponseOutcome::InvalidLink);
            }
        };

        match binding.action {
            ActionKind::Accept => self.fresh_accept(tx, binding).await,
            ActionKind::Decline => fresh_decline(tx, binding).await,
        }
    }

    async fn fresh_accept(
        &self,
        mut tx: DbTransaction,
        binding: TokenBinding,
    ) -> Result<ResponseOutcome> {
        let TokenBinding {
            case_id,
            candidate_id,
            ..
        } = binding;
        let now = DispatchDb::now_millis();

        let Some(row) =
            DispatchDb::get_dispatch_candidate_in(&mut tx, &case_id, &candidate_id).await?
        else {
            tx.rollback().await.map_err(DbError::from)?;
            METRICS.inc_tokens_invalid();
            warn!(case_id = %case_id, candidate_id = %candidate_id, "Token without a dispatch row");
            return Ok(ResponseOutcome::InvalidLink);
        };

        let outcome = match row.status {
            CandidateStatus::Notified => {
                if DispatchDb::claim_open_case_in(&mut tx, &case_id, &candidate_id, now).await? {
                    let losers = match claim_rows_in(&mut tx, &case_id, &candidate_id, now).await {
                        Ok(losers) => losers,
                        Err(err) => {
                            tx.rollback().await.map_err(DbError::from)?;
                            return Err(err);
                        }
                    };
                    tx.commit().await.map_err(DbError::from)?;

                    METRICS.inc_claims_won();
                    info!(
                        case_id = %case_id,
                        candidate_id = %candidate_id,
                        losers = losers.len(),
                        "Case assigned"
                    );
                    let resolver = self.clone();
                    self.spawn_announcement(async move {
                        resolver
                            .announce_claim(&case_id, &candidate_id, &losers)
                            .await
                    });
                    return Ok(ResponseOutcome::Assigned);
                }

                match DispatchDb::get_case_in(&mut tx, &case_id).await? {
                    Some(case) if case.status == CaseStatus::Assigned => {
                        DispatchDb::mark_lost_in(&mut tx, &case_id, &candidate_id, now).await?;
                        METRICS.inc_claims_lost();
                        ResponseOutcome::CaseAlreadyAssigned
                    }
                    Some(case) if case.is_open() => {
                        return self.accept_past_deadline(tx, case, &candidate_id, now).await;
                    }
                    _ => ResponseOutcome::AlreadyLost,
                }
            }
            CandidateStatus::Accepted => ResponseOutcome::AlreadyAccepted,
            CandidateStatus::Declined => ResponseOutcome::AlreadyDeclined,
            CandidateStatus::Lost => {
                match DispatchDb::case_status_in(&mut tx, &case_id).await? {
                    Some(CaseStatus::Assigned) => {
                        METRICS.inc_claims_lost();
                        ResponseOutcome::CaseAlreadyAssigned
                    }
                    _ => ResponseOutcome::AlreadyLost,
                }
            }
            CandidateStatus::Expired => ResponseOutcome::AlreadyLost,
        };

        // The token stays consumed whatever the outcome.
        tx.commit().await.map_err(DbError::from)?;
        info!(case_id = %case_id, candidate_id = %candidate_id, outcome = %outcome, "Accept resolved");
        Ok(outcome)
    }

    /// The case is still OPEN but its deadline has passed and no sweep has
    /// closed it yet.
    ///
    /// If the escalation policy may still extend the case, the transaction is
    /// rolled back so the link stays usable after a rebroadcast. Otherwise the
    /// case expires here, exactly as the sweep would expire it.
    async fn accept_past_deadline(
        &self,
        mut tx: DbTransaction,
        case: Case,
        candidate_id: &CandidateId,
        now: i64,
    ) -> Result<ResponseOutcome> {
        if self.escalation.may_extend(&case) {
            tx.rollback().await.map_err(DbError::from)?;
            info!(
                case_id = %case.id,
                candidate_id = %candidate_id,
                round = case.escalation_round,
                "Accept after deadline; case awaits escalation"
            );
            return Ok(ResponseOutcome::AlreadyLost);
        }

        let flag_for_operator = self.escalation.flags_operator();
        let expired =
            DispatchDb::expire_open_case_in(&mut tx, &case.id, now, flag_for_operator).await?;
        tx.commit().await.map_err(DbError::from)?;

        if expired {
            METRICS.inc_cases_expired();
            if flag_for_operator {
                METRICS.inc_cases_escalated();
            }
            info!(case_id = %case.id, candidate_id = %candidate_id, "Case expired on late accept");

            let fanout = self.fanout.clone();
            self.spawn_announcement(async move {
                let notice = fanout.templates().owner_expired(&case);
                fanout.notify_owner(&case, notice).await;
            });
        }
        Ok(ResponseOutcome::AlreadyLost)
    }

    /// Winner confirmation, case-taken notices and the owner notice.
    async fn announce_claim(&self, case_id: &CaseId, winner: &CandidateId, losers: &[CandidateId]) {
        let case = match self.db.get_case(case_id).await {
            Ok(Some(case)) => case,
            Ok(None) => {
                error!(case_id = %case_id, "Assigned case vanished before announcements");
                return;
            }
            Err(err) => {
                METRICS.inc_db_errors();
                error!(case_id = %case_id, error = %err, "Failed to load case for announcements");
                return;
            }
        };

        self.fanout.announce_assigned(&case, winner).await;
        if !losers.is_empty() {
            self.fanout.announce_lost(&case, losers).await;
        }

        let vet_name = self.fanout.display_name(winner).await;
        let notice = self.fanout.templates().owner_assigned(&case, &vet_name);
        self.fanout.notify_owner(&case, notice).await;
    }
}

/// Winner to ACCEPTED and every other NOTIFIED row to LOST, then verify that
/// the case has exactly one ACCEPTED row.
async fn claim_rows_in(
    tx: &mut DbTransaction,
    case_id: &CaseId,
    winner: &CandidateId,
    now: i64,
) -> Result<Vec<CandidateId>> {
    if !DispatchDb::mark_accepted_in(tx, case_id, winner, now).await? {
        return Err(DispatchError::invariant(format!(
            "claimed case {} but row for {} was not NOTIFIED",
            case_id, winner
        )));
    }
    let losers = DispatchDb::mark_lost_except_in(tx, case_id, winner, now).await?;

    let accepted = DispatchDb::count_accepted_in(tx, case_id).await?;
    if accepted != 1 {
        error!(case_id = %case_id, accepted, "More than one accepted candidate");
        return Err(DispatchError::invariant(format!(
            "case {} has {} accepted candidates",
            case_id, accepted
        )));
    }
    Ok(losers)
}

async fn fresh_decline(mut tx: DbTransaction, binding: TokenBinding) -> Result<ResponseOutcome> {
    let TokenBinding {
        case_id,
        candidate_id,
        ..
    } = binding;

    let status = DispatchDb::get_dispatch_candidate_in(&mut tx, &case_id, &candidate_id)
        .await?
        .map(|row| row.status);

    let outcome = match status {
        None => {
            tx.rollback().await.map_err(DbError::from)?;
            METRICS.inc_tokens_invalid();
            warn!(case_id = %case_id, candidate_id = %candidate_id, "Token without a dispatch row");
            return Ok(ResponseOutcome::InvalidLink);
        }
        Some(CandidateStatus::Notified) => {
            let now = DispatchDb::now_millis();
            if DispatchDb::mark_declined_in(&mut tx, &case_id, &candidate_id, now).await? {
                METRICS.inc_declines();
                ResponseOutcome::Declined
            } else {
                ResponseOutcome::AlreadyLost
            }
        }
        Some(CandidateStatus::Accepted) => ResponseOutcome::AlreadyAccepted,
        Some(CandidateStatus::Declined) => ResponseOutcome::AlreadyDeclined,
        Some(CandidateStatus::Lost) | Some(CandidateStatus::Expired) => {
            ResponseOutcome::AlreadyLost
        }
    };

    tx.commit().await.map_err(DbError::from)?;
    info!(case_id = %case_id, candidate_id = %candidate_id, outcome = %outcome, "Decline resolved");
    Ok(outcome)
}

/// A consumed token only reports the candidate's current state.
async fn replay_outcome(tx: &mut DbTransaction, binding: &TokenBinding) -> Result<ResponseOutcome> {
    METRICS.inc_tokens_replayed();
    let row =
        DispatchDb::get_dispatch_candidate_in(tx, &binding.case_id, &binding.candidate_id).await?;

    let outcome = match row.map(|r| r.status) {
        Some(CandidateStatus::Accepted) => ResponseOutcome::AlreadyAccepted,
        Some(CandidateStatus::Declined) => ResponseOutcome::AlreadyDeclined,
        Some(_) => ResponseOutcome::AlreadyLost,
        None => ResponseOutcome::InvalidLink,
    };
    debug!(
        case_id = %binding.case_id,
        candidate_id = %binding.candidate_id,
        outcome = %outcome,
        "Replayed token"
    );
    Ok(outcome)
}

fn vault_to_dispatch(err: VaultError) -> DispatchError {
    match err {
        VaultError::Db(err) => DispatchError::Db(err),
        other => DispatchError::invariant(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::FanoutConfig;
    use crate::selector::{CandidateContact, CandidateDirectory};
    use crate::sender::{NotificationSender, OutboundEmail, SendError};
    use crate::templates::MessageTemplates;
    use crate::token_vault::TokenPair;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use vetdispatch_db::NewCase;
    use vetdispatch_protocol::{ConsultationKind, MessageKind};

    #[derive(Default)]
    struct Outbox(Mutex<Vec<OutboundEmail>>);

    #[async_trait]
    impl NotificationSender for Outbox {
        async fn send(&self, email: &OutboundEmail) -> std::result::Result<(), SendError> {
            self.0.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    struct Directory;

    #[async_trait]
    impl CandidateDirectory for Directory {
        async fn contact(
            &self,
            candidate_id: &CandidateId,
        ) -> std::result::Result<Option<CandidateContact>, DbError> {
            Ok(Some(CandidateContact {
                candidate_id: candidate_id.clone(),
                display_name: format!("Dr. {}", candidate_id),
                email: format!("{}@vets.example", candidate_id),
            }))
        }
    }

    struct Fixture {
        db: DispatchDb,
        outbox: Arc<Outbox>,
        resolver: ClaimResolver,
        case_id: CaseId,
        tokens: HashMap<CandidateId, TokenPair>,
    }

    fn cand(id: &str) -> CandidateId {
        CandidateId::parse(id).unwrap()
    }

    async fn fixture(candidates: &[&str]) -> Fixture {
        fixture_with(candidates, Duration::from_secs(600), EscalationPolicy::Expire).await
    }

    async fn fixture_with(
        candidates: &[&str],
        ttl: Duration,
        escalation: EscalationPolicy,
    ) -> Fixture {
        let db = DispatchDb::open_in_memory().await.unwrap();
        let case = db
            .insert_case(
                &NewCase {
                    city: "Lahore".into(),
                    state: None,
                    address: None,
                    species: "Cow".into(),
                    issue: "not eating".into(),
                    is_emergency: false,
                    consultation_kind: ConsultationKind::Physical,
                    owner_name: "Ayesha".into(),
                    owner_email: Some("ayesha@example.com".into()),
                    owner_phone: None,
                    ttl_secs: None,
                },
                ttl,
            )
            .await
            .unwrap();

        let mut tokens = HashMap::new();
        let mut tx = db.begin().await.unwrap();
        for name in candidates {
            let id = cand(name);
            assert!(DispatchDb::insert_candidate_in(&mut tx, &case.id, &id, 0, 1)
                .await
                .unwrap());
            let pair = TokenVault::issue_pair_in(&mut tx, &case.id, &id).await.unwrap();
            tokens.insert(id, pair);
        }
        tx.commit().await.unwrap();

        let outbox = Arc::new(Outbox::default());
        let fanout = NotificationFanout::new(
            db.clone(),
            outbox.clone(),
            Arc::new(Directory),
            MessageTemplates::new("http://localhost"),
            FanoutConfig::default(),
        );
        Fixture {
            resolver: ClaimResolver::new(db.clone(), fanout, escalation),
            db,
            outbox,
            case_id: case.id,
            tokens,
        }
    }

    impl Fixture {
        fn accept(&self, id: &str) -> &str {
            &self.tokens[&cand(id)].accept
        }

        fn decline(&self, id: &str) -> &str {
            &self.tokens[&cand(id)].decline
        }

        async fn status(&self, id: &str) -> CandidateStatus {
            self.db
                .get_dispatch_candidate(&self.case_id, &cand(id))
                .await
                .unwrap()
                .unwrap()
                .status
        }
    }

    #[tokio::test]
    async fn test_accept_assigns_and_replay_is_informational() {
        let f = fixture(&["v1", "v2", "v3"]).await;

        let first = f.resolver.accept_via_token(f.accept("v2")).await.unwrap();
        assert_eq!(first, ResponseOutcome::Assigned);
        f.resolver.wait_for_announcements().await;
        let sends_after_claim = f.outbox.0.lock().unwrap().len();

        let again = f.resolver.accept_via_token(f.accept("v2")).await.unwrap();
        assert_eq!(again, ResponseOutcome::AlreadyAccepted);
        f.resolver.wait_for_announcements().await;
        assert_eq!(f.outbox.0.lock().unwrap().len(), sends_after_claim);

        let case = f.db.get_case(&f.case_id).await.unwrap().unwrap();
        assert_eq!(case.status, CaseStatus::Assigned);
        assert_eq!(case.assigned_candidate_id, Some(cand("v2")));
        assert_eq!(f.status("v1").await, CandidateStatus::Lost);
        assert_eq!(f.status("v3").await, CandidateStatus::Lost);

        // winner + two losers + owner
        assert_eq!(sends_after_claim, 4);
    }

    #[tokio::test]
    async fn test_late_accept_after_claim() {
        let f = fixture(&["v1", "v2"]).await;
        f.resolver.accept_via_token(f.accept("v1")).await.unwrap();

        let late = f.resolver.accept_via_token(f.accept("v2")).await.unwrap();
        assert_eq!(late, ResponseOutcome::CaseAlreadyAssigned);
        assert_eq!(f.status("v2").await, CandidateStatus::Lost);

        // Consumed now; a second click only reports state.
        let replay = f.resolver.accept_via_token(f.accept("v2")).await.unwrap();
        assert_eq!(replay, ResponseOutcome::AlreadyLost);
    }

    #[tokio::test]
    async fn test_decline_does_not_block_others() {
        let f = fixture(&["v1", "v2"]).await;

        assert_eq!(
            f.resolver.decline_via_token(f.decline("v1")).await.unwrap(),
            ResponseOutcome::Declined
        );
        assert_eq!(
            f.resolver.accept_via_token(f.accept("v2")).await.unwrap(),
            ResponseOutcome::Assigned
        );
        assert_eq!(f.status("v1").await, CandidateStatus::Declined);

        // The decliner's accept link can only report the decline.
        assert_eq!(
            f.resolver.accept_via_token(f.accept("v1")).await.unwrap(),
            ResponseOutcome::AlreadyDeclined
        );

        f.resolver.wait_for_announcements().await;
        let taken = f
            .db
            .delivered_candidates(&f.case_id, MessageKind::CaseTaken)
            .await
            .unwrap();
        assert!(taken.is_empty());
    }

    #[tokio::test]
    async fn test_decline_after_accept_reports_acceptance() {
        let f = fixture(&["v1"]).await;
        f.resolver.accept_via_token(f.accept("v1")).await.unwrap();
        assert_eq!(
            f.resolver.decline_via_token(f.decline("v1")).await.unwrap(),
            ResponseOutcome::AlreadyAccepted
        );
        assert_eq!(f.status("v1").await, CandidateStatus::Accepted);
    }

    #[tokio::test]
    async fn test_respond_rejects_foreign_case_and_wrong_action() {
        let f = fixture(&["v1"]).await;
        let other_case = CaseId::new();

        let foreign = f
            .resolver
            .respond(&other_case, f.accept("v1"), ActionKind::Accept)
            .await
            .unwrap();
        assert_eq!(foreign, ResponseOutcome::InvalidLink);

        let wrong_action = f
            .resolver
            .respond(&f.case_id, f.accept("v1"), ActionKind::Decline)
            .await
            .unwrap();
        assert_eq!(wrong_action, ResponseOutcome::InvalidLink);

        let garbage = f
            .resolver
            .respond(&f.case_id, "not a token", ActionKind::Accept)
            .await
            .unwrap();
        assert_eq!(garbage, ResponseOutcome::InvalidLink);

        // Neither bad request consumed the token.
        assert_eq!(
            f.resolver
                .respond(&f.case_id, f.accept("v1"), ActionKind::Accept)
                .await
                .unwrap(),
            ResponseOutcome::Assigned
        );
    }

    #[tokio::test]
    async fn test_accept_on_cancelled_case_is_lost() {
        let f = fixture(&["v1"]).await;
        assert!(f
            .db
            .cancel_open_case(&f.case_id, DispatchDb::now_millis())
            .await
            .unwrap());

        assert_eq!(
            f.resolver.accept_via_token(f.accept("v1")).await.unwrap(),
            ResponseOutcome::AlreadyLost
        );
        assert_eq!(
            f.resolver.decline_via_token(f.decline("v1")).await.unwrap(),
            ResponseOutcome::AlreadyLost
        );
        assert!(f.outbox.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accept_after_deadline_expires_case() {
        let f = fixture_with(&["v1", "v2"], Duration::ZERO, EscalationPolicy::Expire).await;

        assert_eq!(
            f.resolver.accept_via_token(f.accept("v1")).await.unwrap(),
            ResponseOutcome::AlreadyLost
        );
        let case = f.db.get_case(&f.case_id).await.unwrap().unwrap();
        assert_eq!(case.status, CaseStatus::Expired);
        assert!(case.assigned_candidate_id.is_none());
        assert_eq!(f.status("v1").await, CandidateStatus::Expired);
        assert_eq!(f.status("v2").await, CandidateStatus::Expired);

        // Only the owner hears about it.
        f.resolver.wait_for_announcements().await;
        let sent = f.outbox.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ayesha@example.com");

        assert_eq!(
            f.resolver.accept_via_token(f.accept("v2")).await.unwrap(),
            ResponseOutcome::AlreadyLost
        );
    }

    #[tokio::test]
    async fn test_accept_after_deadline_keeps_link_for_rebroadcast() {
        let f = fixture_with(
            &["v1"],
            Duration::ZERO,
            EscalationPolicy::Rebroadcast { max_rounds: 1 },
        )
        .await;

        assert_eq!(
            f.resolver.accept_via_token(f.accept("v1")).await.unwrap(),
            ResponseOutcome::AlreadyLost
        );
        let case = f.db.get_case(&f.case_id).await.unwrap().unwrap();
        assert_eq!(case.status, CaseStatus::Open);
        assert_eq!(f.status("v1").await, CandidateStatus::Notified);

        let mut tx = f.db.begin().await.unwrap();
        let later = DispatchDb::now_millis() + 60_000;
        assert!(DispatchDb::extend_open_case_in(&mut tx, &f.case_id, 0, later)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        assert_eq!(
            f.resolver.accept_via_token(f.accept("v1")).await.unwrap(),
            ResponseOutcome::Assigned
        );
    }
}
