//! Claim race tests against a file-backed database.
//!
//! Every test here drives concurrent redemptions through separate pooled
//! connections and checks that the store, not timing, decides the winner.

mod common;

use common::{cand, deliveries, token};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use vetdispatch_engine::DispatchEngine;
use vetdispatch_protocol::{
    ActionKind, CandidateStatus, CaseStatus, DeliveryStatus, MessageKind, ResponseOutcome,
};
use vetdispatch_test_utils::{
    lahore_cow, test_config, test_engine, RecordingSender, StaticCandidateSource, StaticDirectory,
    TestDb,
};

async fn engine_with(db: &TestDb, candidates: &[&str]) -> (DispatchEngine, Arc<RecordingSender>) {
    let sender = RecordingSender::new();
    let engine = test_engine(
        db,
        &test_config(),
        StaticCandidateSource::new(candidates),
        StaticDirectory::new(),
        sender.clone(),
    );
    (engine, sender)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_many_concurrent_accepts_wins() {
    let names = ["v1", "v2", "v3", "v4", "v5", "v6", "v7", "v8"];
    let db = TestDb::new().await.unwrap();
    let (engine, _sender) = engine_with(&db, &names).await;
    let case = engine.coordinator.submit_case(lahore_cow()).await.unwrap().case;

    let barrier = Arc::new(Barrier::new(names.len()));
    let mut handles = Vec::new();
    for name in names {
        let accept = token(&db, &case.id, name, ActionKind::Accept).await;
        let resolver = engine.resolver.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            (name, resolver.accept_via_token(&accept).await.unwrap())
        }));
    }

    let mut winners = Vec::new();
    let mut too_late = 0;
    for handle in handles {
        match handle.await.unwrap() {
            (name, ResponseOutcome::Assigned) => winners.push(name),
            (_, ResponseOutcome::CaseAlreadyAssigned) => too_late += 1,
            (name, other) => panic!("{name} got {other:?}"),
        }
    }
    assert_eq!(winners.len(), 1, "winners: {winners:?}");
    assert_eq!(too_late, names.len() - 1);

    let case = db.get_case(&case.id).await.unwrap().unwrap();
    assert_eq!(case.status, CaseStatus::Assigned);
    assert_eq!(case.assigned_candidate_id, Some(cand(winners[0])));

    let rows = db.list_dispatch_candidates(&case.id).await.unwrap();
    let accepted: Vec<_> = rows
        .iter()
        .filter(|r| r.status == CandidateStatus::Accepted)
        .collect();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].candidate_id, cand(winners[0]));
    assert!(rows
        .iter()
        .filter(|r| r.candidate_id != cand(winners[0]))
        .all(|r| r.status == CandidateStatus::Lost));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_token_redeemed_twice_concurrently_has_one_fresh_outcome() {
    let db = TestDb::new().await.unwrap();
    let (engine, sender) = engine_with(&db, &["v1", "v2"]).await;
    let case = engine.coordinator.submit_case(lahore_cow()).await.unwrap().case;
    let accept = token(&db, &case.id, "v1", ActionKind::Accept).await;

    let (a, b) = tokio::join!(
        engine.resolver.accept_via_token(&accept),
        engine.resolver.accept_via_token(&accept)
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| o.code());
    assert_eq!(
        outcomes,
        vec![ResponseOutcome::AlreadyAccepted, ResponseOutcome::Assigned]
    );
    engine.resolver.wait_for_announcements().await;

    let confirmations = deliveries(&db, &case.id, MessageKind::AcceptanceConfirmation).await;
    assert_eq!(confirmations.len(), 1);
    assert_eq!(sender.sent_to(&StaticDirectory::address_of("v1")).len(), 2);
}

#[tokio::test]
async fn repeated_accept_is_idempotent_and_sends_nothing_new() {
    let db = TestDb::new().await.unwrap();
    let (engine, sender) = engine_with(&db, &["v1", "v2", "v3"]).await;
    let case = engine.coordinator.submit_case(lahore_cow()).await.unwrap().case;
    let accept = token(&db, &case.id, "v3", ActionKind::Accept).await;

    assert_eq!(
        engine.resolver.accept_via_token(&accept).await.unwrap(),
        ResponseOutcome::Assigned
    );
    engine.resolver.wait_for_announcements().await;
    let sent = sender.count();

    for _ in 0..3 {
        assert_eq!(
            engine.resolver.accept_via_token(&accept).await.unwrap(),
            ResponseOutcome::AlreadyAccepted
        );
    }
    engine.resolver.wait_for_announcements().await;
    assert_eq!(sender.count(), sent);
    assert_eq!(
        deliveries(&db, &case.id, MessageKind::CaseTaken).await.len(),
        2
    );
}

#[tokio::test]
async fn decline_does_not_block_a_later_accept() {
    let db = TestDb::new().await.unwrap();
    let (engine, _sender) = engine_with(&db, &["a", "b"]).await;
    let case = engine.coordinator.submit_case(lahore_cow()).await.unwrap().case;

    let decline_a = token(&db, &case.id, "a", ActionKind::Decline).await;
    let accept_b = token(&db, &case.id, "b", ActionKind::Accept).await;

    assert_eq!(
        engine.resolver.decline_via_token(&decline_a).await.unwrap(),
        ResponseOutcome::Declined
    );
    let still_open = db.get_case(&case.id).await.unwrap().unwrap();
    assert_eq!(still_open.status, CaseStatus::Open);

    assert_eq!(
        engine.resolver.accept_via_token(&accept_b).await.unwrap(),
        ResponseOutcome::Assigned
    );
    assert_eq!(
        engine.resolver.decline_via_token(&decline_a).await.unwrap(),
        ResponseOutcome::AlreadyDeclined
    );

    let a = db
        .get_dispatch_candidate(&case.id, &cand("a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.status, CandidateStatus::Declined);
}

#[tokio::test]
async fn fan_out_after_claim_is_complete() {
    let db = TestDb::new().await.unwrap();
    let names = ["v1", "v2", "v3", "v4", "v5"];
    let (engine, _sender) = engine_with(&db, &names).await;
    let case = engine.coordinator.submit_case(lahore_cow()).await.unwrap().case;

    let decline = token(&db, &case.id, "v4", ActionKind::Decline).await;
    engine.resolver.decline_via_token(&decline).await.unwrap();
    let accept = token(&db, &case.id, "v2", ActionKind::Accept).await;
    engine.resolver.accept_via_token(&accept).await.unwrap();
    engine.resolver.wait_for_announcements().await;

    let confirmations = deliveries(&db, &case.id, MessageKind::AcceptanceConfirmation).await;
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].candidate_id, Some(cand("v2")));

    // K - 1 minus the one who declined
    let taken = deliveries(&db, &case.id, MessageKind::CaseTaken).await;
    assert_eq!(taken.len(), names.len() - 2);
    assert!(taken.iter().all(|d| d.status == DeliveryStatus::Sent));
    assert!(taken.iter().all(|d| d.candidate_id != Some(cand("v4"))));

    let owner = deliveries(&db, &case.id, MessageKind::Other).await;
    assert_eq!(owner.len(), 1);
    assert_eq!(owner[0].recipient_email.as_deref(), Some("ayesha@owners.test"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lahore_cow_scenario() {
    let db = TestDb::new().await.unwrap();
    let (engine, sender) = engine_with(&db, &["V1", "V2", "V3"]).await;
    let submission = engine.coordinator.submit_case(lahore_cow()).await.unwrap();
    let case = submission.case;

    let initial = deliveries(&db, &case.id, MessageKind::InitialNotification).await;
    assert_eq!(initial.len(), 3);
    assert!(initial.iter().all(|d| d.status == DeliveryStatus::Sent));
    assert_eq!(sender.with_subject("New Cow case in Lahore").len(), 3);

    let v2 = token(&db, &case.id, "V2", ActionKind::Accept).await;
    let v3 = token(&db, &case.id, "V3", ActionKind::Accept).await;
    let (r2, r3) = tokio::join!(
        engine.resolver.accept_via_token(&v2),
        engine.resolver.accept_via_token(&v3)
    );
    let mut outcomes = vec![r2.unwrap(), r3.unwrap()];
    outcomes.sort_by_key(|o| o.code());
    assert_eq!(
        outcomes,
        vec![ResponseOutcome::Assigned, ResponseOutcome::CaseAlreadyAssigned]
    );

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let v1 = token(&db, &case.id, "V1", ActionKind::Accept).await;
    assert_eq!(
        engine.resolver.accept_via_token(&v1).await.unwrap(),
        ResponseOutcome::CaseAlreadyAssigned
    );
    let v1_row = db
        .get_dispatch_candidate(&case.id, &cand("V1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v1_row.status, CandidateStatus::Lost);

    engine.resolver.wait_for_announcements().await;

    assert_eq!(
        deliveries(&db, &case.id, MessageKind::CaseTaken).await.len(),
        2
    );
    assert_eq!(
        deliveries(&db, &case.id, MessageKind::AcceptanceConfirmation)
            .await
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn announcements_outlive_a_dropped_request() {
    let db = TestDb::new().await.unwrap();
    let sender = RecordingSender::with_delay(Duration::from_millis(300));
    let engine = test_engine(
        &db,
        &test_config(),
        StaticCandidateSource::new(&["v1", "v2", "v3"]),
        StaticDirectory::new(),
        sender.clone(),
    );
    let case = engine.coordinator.submit_case(lahore_cow()).await.unwrap().case;
    let accept = token(&db, &case.id, "v1", ActionKind::Accept).await;

    // The sends take 300ms each; the request is gone long before they finish.
    let request = {
        let resolver = engine.resolver.clone();
        tokio::spawn(async move { resolver.accept_via_token(&accept).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    request.abort();
    if let Ok(outcome) = request.await {
        assert_eq!(outcome.unwrap(), ResponseOutcome::Assigned);
    }

    let assigned = db.get_case(&case.id).await.unwrap().unwrap();
    assert_eq!(assigned.status, CaseStatus::Assigned);

    engine.resolver.wait_for_announcements().await;
    let confirmations = deliveries(&db, &case.id, MessageKind::AcceptanceConfirmation).await;
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].status, DeliveryStatus::Sent);

    let taken = deliveries(&db, &case.id, MessageKind::CaseTaken).await;
    assert_eq!(taken.len(), 2);
    assert!(taken.iter().all(|d| d.status == DeliveryStatus::Sent));
}
