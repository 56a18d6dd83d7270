//! E2E test driving the reconciliation worker through a full job

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{FakePortal, test_config};
use scorelink::AppState;
use scorelink::cookies::CookieJar;
use scorelink::worker::{ReconcileWorker, ScoreScraper};
use tempfile::TempDir;

const TARGET: &str = "555566667777888";

async fn worker_setup(portal: &FakePortal) -> (AppState, Arc<ReconcileWorker>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path().join("test.db"), &portal.base_url);

    let (state, dispatcher) = AppState::new(config.clone()).await.unwrap();
    tokio::spawn(dispatcher.run());

    // A live session jar with the anti-forgery token.
    let mut jar = CookieJar::new();
    let expiry = Utc::now() + chrono::Duration::days(1);
    jar.set("session", "test-session-value", expiry);
    jar.set("_t", "token-value", expiry);
    state.cookie_store.save("bot-1", &jar).await.unwrap();

    let scraper = ScoreScraper::new(state.db.clone(), state.portal.clone(), &config.worker);
    let worker = Arc::new(ReconcileWorker::new(
        state.db.clone(),
        state.portal.clone(),
        scraper,
        config.worker.clone(),
        config.portal.friend_cap,
    ));

    (state, worker, temp_dir)
}

#[tokio::test]
async fn job_runs_from_queue_to_completed_scores() {
    let portal = FakePortal::start().await;
    let (state, worker, _guard) = worker_setup(&portal).await;

    portal.known_codes.lock().unwrap().insert(TARGET.to_string());
    let job = state
        .db
        .create_job(TARGET, false, chrono::Duration::zero())
        .await
        .unwrap();

    // Tick 1: claim, validate and send the friend request.
    worker.tick().await;
    assert!(portal.invites.lock().unwrap().contains(&TARGET.to_string()));
    assert_eq!(
        portal.last_token.lock().unwrap().as_deref(),
        Some("token-value"),
        "POST must carry the anti-forgery token from the jar"
    );
    let after_send = state.db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(after_send.status, "processing");
    assert_eq!(after_send.stage, "send_request");
    assert!(after_send.request_sent_at.is_some());
    assert_eq!(after_send.bot_account_id.as_deref(), Some("bot-1"));

    // Tick 2: the portal confirms the outstanding request.
    worker.tick().await;
    let waiting = state.db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(waiting.stage, "wait_acceptance");

    // The player accepts.
    portal.accept_invite(TARGET);

    // Tick 3: friendship observed.
    worker.tick().await;
    let accepted = state.db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(accepted.stage, "update_score");

    // Tick 4: all five tiers get scraped and the friendship is dropped.
    worker.tick().await;
    let done = state.db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, "completed");
    assert!(!done.executing);

    let tiers = done.completed_tiers();
    assert_eq!(tiers.len(), 5);

    let result: serde_json::Value = serde_json::from_str(done.result.as_deref().unwrap()).unwrap();
    // Both halves of each tier's comparison page are merged.
    assert_eq!(result["master"].as_array().unwrap().len(), 2);
    assert_eq!(result["basic"][0]["rival_achievement"], 1_000_000);

    assert!(!portal.friends.lock().unwrap().contains(&TARGET.to_string()));
}

#[tokio::test]
async fn skip_update_score_completes_without_scraping() {
    let portal = FakePortal::start().await;
    let (state, worker, _guard) = worker_setup(&portal).await;

    portal.known_codes.lock().unwrap().insert(TARGET.to_string());
    let job = state
        .db
        .create_job(TARGET, true, chrono::Duration::zero())
        .await
        .unwrap();

    worker.tick().await;
    worker.tick().await;
    portal.accept_invite(TARGET);
    worker.tick().await;
    worker.tick().await;

    let done = state.db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, "completed");
    assert!(done.completed_tiers().is_empty());
    assert!(done.result.is_none());
}

#[tokio::test]
async fn unknown_friend_code_fails_the_job() {
    let portal = FakePortal::start().await;
    let (state, worker, _guard) = worker_setup(&portal).await;

    // TARGET is not in known_codes; the search page misses.
    let job = state
        .db
        .create_job(TARGET, false, chrono::Duration::zero())
        .await
        .unwrap();

    worker.tick().await;

    let failed = state.db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, "failed");
    assert!(failed.error.as_deref().unwrap().contains("does not exist"));
    assert!(portal.invites.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pending_request_with_queued_job_is_accepted_directly() {
    let portal = FakePortal::start().await;
    let (state, worker, _guard) = worker_setup(&portal).await;

    // The target acted first: their request is already waiting. No
    // outgoing invite (and so no code validation) should be needed.
    portal.pendings.lock().unwrap().push(TARGET.to_string());
    let job = state
        .db
        .create_job(TARGET, true, chrono::Duration::zero())
        .await
        .unwrap();

    worker.tick().await;

    assert!(portal.invites.lock().unwrap().is_empty());
    assert!(portal.pendings.lock().unwrap().is_empty());
    assert!(portal.friends.lock().unwrap().contains(&TARGET.to_string()));

    let claimed = state.db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(claimed.status, "processing");
    assert_eq!(claimed.stage, "update_score");
    assert_eq!(claimed.bot_account_id.as_deref(), Some("bot-1"));

    // The next tick finishes the job off the formed friendship.
    worker.tick().await;
    let done = state.db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, "completed");
}

#[tokio::test]
async fn drain_sends_at_most_the_capacity_bound() {
    let portal = FakePortal::start().await;
    let (state, worker, _guard) = worker_setup(&portal).await;

    // 8 friendships and 1 outstanding request leave min(2, 9) = 2 slots.
    {
        let mut friends = portal.friends.lock().unwrap();
        friends.clear();
        for i in 0..8 {
            friends.push(format!("90000000000000{}", i));
        }
    }
    portal.invites.lock().unwrap().push("800000000000000".to_string());

    let mut jobs = Vec::new();
    for i in 0..3 {
        let code = format!("70000000000000{}", i);
        portal.known_codes.lock().unwrap().insert(code.clone());
        jobs.push(
            state
                .db
                .create_job(&code, true, chrono::Duration::zero())
                .await
                .unwrap(),
        );
    }

    worker.tick().await;

    let mut statuses = Vec::new();
    for job in &jobs {
        statuses.push(state.db.get_job(&job.id).await.unwrap().unwrap().status);
    }
    assert_eq!(statuses.iter().filter(|s| *s == "processing").count(), 2);
    assert_eq!(statuses.iter().filter(|s| *s == "queued").count(), 1);
    // The orphan invite was canceled; only the two new sends remain.
    assert_eq!(portal.invites.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn orphan_acceptance_is_blocked_only_after_the_grace_window() {
    let portal = FakePortal::start().await;
    let (_state, worker, _guard) = worker_setup(&portal).await;

    // An unsolicited incoming request with no job behind it.
    portal.pendings.lock().unwrap().push("999900001111222".to_string());

    // First sight arms the grace window; nothing is blocked yet.
    worker.tick().await;
    assert_eq!(portal.pendings.lock().unwrap().len(), 1);

    // Still pending once the window (1 s in tests) has passed: blocked.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    worker.tick().await;
    assert!(portal.pendings.lock().unwrap().is_empty());
}

#[tokio::test]
async fn driven_jobs_never_look_stale_to_the_sweep() {
    let portal = FakePortal::start().await;
    let (state, worker, _guard) = worker_setup(&portal).await;

    portal.known_codes.lock().unwrap().insert(TARGET.to_string());
    let job = state
        .db
        .create_job(TARGET, false, chrono::Duration::zero())
        .await
        .unwrap();
    worker.tick().await;
    worker.tick().await;
    let waiting = state.db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(waiting.stage, "wait_acceptance");

    // Simulate a long wait on the target by backdating the last update.
    sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::seconds(60))
        .bind(&job.id)
        .execute(state.db.pool())
        .await
        .unwrap();

    worker.tick().await;

    // The tick refreshed the timestamp, so the sweep never sees the job
    // as abandoned while acceptance is simply slow.
    let refreshed = state.db.get_job(&job.id).await.unwrap().unwrap();
    assert!(refreshed.executing);
    assert_eq!(refreshed.status, "processing");
    assert!(refreshed.updated_at > Utc::now() - chrono::Duration::seconds(5));
}

#[tokio::test]
async fn orphan_sent_requests_are_canceled() {
    let portal = FakePortal::start().await;
    let (_state, worker, _guard) = worker_setup(&portal).await;

    // An invite survives from a previous run with no job behind it.
    portal.invites.lock().unwrap().push("999900001111222".to_string());

    worker.tick().await;

    assert!(portal.invites.lock().unwrap().is_empty());
}
