//! Background reconciliation
//!
//! - `scheduler`: named, cancellable background tasks
//! - `scraper`: per-tier comparison scraping
//! - `ReconcileWorker`: the periodic tick that converges upstream friend
//!   state and the job table toward each other
//!
//! The worker never trusts its own memory of upstream state. Every tick
//! re-reads the portal's friend list, sent requests and pending
//! acceptances, then derives all actions from that snapshot plus the job
//! table. A missed tick therefore costs latency, never correctness.

pub mod scheduler;
mod scraper;

pub use scheduler::Scheduler;
pub use scraper::ScoreScraper;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::WorkerConfig;
use crate::data::{Database, Job, JobPatch, JobStage, JobStatus};
use crate::error::AppError;
use crate::portal::PortalClient;

/// Slots available for new friend requests.
///
/// Both the friend list and the outstanding-sent list are capped
/// upstream; a request consumes a slot in each, so the effective headroom
/// is the smaller of the two.
fn capacity(cap: usize, friends: usize, sent: usize) -> usize {
    cap.saturating_sub(friends).min(cap.saturating_sub(sent))
}

/// Periodic reconciliation between the job table and the portal
pub struct ReconcileWorker {
    db: Arc<Database>,
    portal: PortalClient,
    scraper: ScoreScraper,
    config: WorkerConfig,
    friend_cap: usize,
    /// Tick mutual exclusion; a tick that finds this set skips
    in_progress: AtomicBool,
    /// Epoch millis when the running tick started; 0 while idle
    tick_started_ms: AtomicU64,
    /// Orphan acceptances seen recently, with their block deadline
    block_deadlines: Mutex<HashMap<String, Instant>>,
    /// Friend codes already confirmed to exist upstream
    validated_codes: Mutex<HashSet<String>>,
}

impl ReconcileWorker {
    pub fn new(
        db: Arc<Database>,
        portal: PortalClient,
        scraper: ScoreScraper,
        config: WorkerConfig,
        friend_cap: usize,
    ) -> Self {
        Self {
            db,
            portal,
            scraper,
            config,
            friend_cap,
            in_progress: AtomicBool::new(false),
            tick_started_ms: AtomicU64::new(0),
            block_deadlines: Mutex::new(HashMap::new()),
            validated_codes: Mutex::new(HashSet::new()),
        }
    }

    /// One reconciliation pass.
    ///
    /// Skips entirely when a previous tick is still running, unless that
    /// tick has exceeded the watchdog timeout, in which case the stale
    /// marker is forcibly cleared after checking the session is still
    /// usable.
    pub async fn tick(&self) {
        if !self.try_enter().await {
            return;
        }

        let started = Instant::now();
        if let Err(error) = self.run_tick().await {
            tracing::error!(%error, "Reconciliation tick failed");
        }
        tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Tick finished");

        self.tick_started_ms.store(0, Ordering::SeqCst);
        self.in_progress.store(false, Ordering::SeqCst);
    }

    async fn try_enter(&self) -> bool {
        let now_ms = Utc::now().timestamp_millis() as u64;
        if !self.in_progress.swap(true, Ordering::SeqCst) {
            self.tick_started_ms.store(now_ms, Ordering::SeqCst);
            return true;
        }

        let started_ms = self.tick_started_ms.load(Ordering::SeqCst);
        let watchdog_ms = self.config.watchdog_timeout_seconds * 1000;
        if started_ms == 0 || now_ms.saturating_sub(started_ms) < watchdog_ms {
            tracing::debug!("Previous tick still running, skipping");
            return false;
        }

        // The previous tick is presumed wedged. Confirm the session jar
        // still exists before stealing the marker, so a dead session does
        // not turn into a hot loop of failing ticks.
        tracing::warn!(
            stuck_ms = now_ms.saturating_sub(started_ms),
            "Tick watchdog fired, reclaiming stuck reconciliation marker"
        );
        match self.db.get_cookie_jar(&self.config.bot_account_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::error!(
                    account_id = %self.config.bot_account_id,
                    "No session jar for bot account; reconciliation cannot proceed"
                );
            }
            Err(error) => {
                tracing::error!(%error, "Session jar check failed during watchdog recovery");
                return false;
            }
        }

        self.tick_started_ms.store(now_ms, Ordering::SeqCst);
        true
    }

    async fn run_tick(&self) -> Result<(), AppError> {
        self.db
            .sweep_stale_executing(chrono::Duration::seconds(
                self.config.dead_job_timeout_seconds as i64,
            ))
            .await?;

        // One consistent upstream snapshot per tick.
        let (friends, sent, pending) = tokio::join!(
            self.portal.friend_list(),
            self.portal.sent_requests(),
            self.portal.pending_acceptances(),
        );
        let friends = friends?;
        let sent = sent?;
        let pending = pending?;

        let live = self.db.live_jobs().await?;
        let ours: Vec<&Job> = live
            .iter()
            .filter(|job| {
                job.status() == Some(JobStatus::Processing)
                    && job.bot_account_id.as_deref() == Some(self.config.bot_account_id.as_str())
            })
            .collect();
        let live_codes: HashSet<&str> = live.iter().map(|job| job.friend_code.as_str()).collect();

        let mut slots = capacity(self.friend_cap, friends.len(), sent.len());
        tracing::debug!(
            friends = friends.len(),
            sent = sent.len(),
            pending = pending.len(),
            jobs = ours.len(),
            slots,
            "Reconciliation snapshot"
        );

        self.cancel_orphan_sent(&sent, &live_codes).await;
        self.handle_orphan_acceptances(&pending, &live_codes).await;
        self.accept_pending_queued(&live, &pending, &mut slots).await;

        for &job in &ours {
            // A job the worker is driving is never stale, however long
            // the target takes to respond.
            self.db.touch_job(&job.id).await.ok();
            if let Err(error) = self.advance_job(job, &friends, &sent, &pending, &mut slots).await {
                tracing::error!(job_id = %job.id, %error, "Job step failed");
                self.db.fail_job(&job.id, &error.to_string()).await.ok();
                if friends.iter().any(|code| *code == job.friend_code) {
                    self.portal.drop_friend(&job.friend_code).await.ok();
                }
            }
        }

        self.drain_queued(&mut slots).await?;
        Ok(())
    }

    /// Cancel sent requests no live job is waiting on
    async fn cancel_orphan_sent(&self, sent: &[String], live_codes: &HashSet<&str>) {
        for code in sent {
            if live_codes.contains(code.as_str()) {
                continue;
            }
            tracing::info!(friend_code = %code, "Canceling orphan friend request");
            if let Err(error) = self.portal.cancel_friend_request(code).await {
                tracing::error!(friend_code = %code, %error, "Orphan cancel failed");
            }
        }
    }

    /// Incoming requests from accounts no job knows about get a grace
    /// window, then a block. The grace absorbs races where the job is
    /// created moments after the player sends their request.
    async fn handle_orphan_acceptances(&self, pending: &[String], live_codes: &HashSet<&str>) {
        let now = Instant::now();
        let grace = Duration::from_secs(self.config.block_grace_seconds);

        let to_block: Vec<String> = {
            let mut deadlines = self.block_deadlines.lock().unwrap_or_else(|e| e.into_inner());
            deadlines.retain(|code, _| pending.iter().any(|p| p == code));

            let mut expired = Vec::new();
            for code in pending {
                if live_codes.contains(code.as_str()) {
                    deadlines.remove(code);
                    continue;
                }
                let deadline = *deadlines.entry(code.clone()).or_insert_with(|| now + grace);
                if now >= deadline {
                    expired.push(code.clone());
                }
            }
            for code in &expired {
                deadlines.remove(code);
            }
            expired
        };

        for code in to_block {
            if let Err(error) = self.portal.block_friend(&code).await {
                tracing::error!(friend_code = %code, %error, "Block failed");
            }
        }
    }

    /// A target that acted first shows up as a pending acceptance while
    /// its job is still queued. Claim the job and accept the request
    /// directly instead of answering with a redundant outgoing invite.
    async fn accept_pending_queued(&self, live: &[Job], pending: &[String], slots: &mut usize) {
        for code in pending {
            if *slots == 0 {
                return;
            }
            let Some(job) = live
                .iter()
                .find(|job| job.status() == Some(JobStatus::Queued) && job.friend_code == *code)
            else {
                continue;
            };

            let claimed = match self.db.claim_job(&job.id, &self.config.bot_account_id).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => continue,
                Err(error) => {
                    tracing::error!(job_id = %job.id, %error, "Claim for pending acceptance failed");
                    continue;
                }
            };

            tracing::info!(
                job_id = %claimed.id,
                friend_code = %code,
                "Accepting friend request the target sent first"
            );
            let accepted = self.portal.accept_friend_request(code).await;
            let advanced = match accepted {
                Ok(()) => self.advance_stage(&claimed, JobStage::UpdateScore).await,
                Err(error) => Err(error),
            };
            match advanced {
                Ok(()) => *slots -= 1,
                Err(error) => {
                    tracing::error!(job_id = %claimed.id, %error, "Accept failed");
                    self.db.fail_job(&claimed.id, &error.to_string()).await.ok();
                }
            }
        }
    }

    /// Advance one claimed job through its stage machine
    async fn advance_job(
        &self,
        job: &Job,
        friends: &[String],
        sent: &[String],
        pending: &[String],
        slots: &mut usize,
    ) -> Result<(), AppError> {
        let code = job.friend_code.as_str();
        let is_friend = friends.iter().any(|c| c == code);
        let is_sent = sent.iter().any(|c| c == code);
        let is_pending = pending.iter().any(|c| c == code);

        match job.stage() {
            Some(JobStage::SendRequest) => {
                match job.request_sent_at {
                    None => {
                        // Claimed but not sent yet (or crashed before the
                        // send); treat like a fresh claim. An incoming
                        // request from the target beats sending our own.
                        if is_friend {
                            self.advance_stage(job, JobStage::UpdateScore).await?;
                        } else if is_pending {
                            if *slots == 0 {
                                return Ok(());
                            }
                            self.portal.accept_friend_request(code).await?;
                            *slots -= 1;
                            self.advance_stage(job, JobStage::UpdateScore).await?;
                        } else {
                            if *slots == 0 {
                                return Ok(());
                            }
                            self.send_request(job).await?;
                            *slots -= 1;
                        }
                    }
                    Some(sent_at) => {
                        if is_friend {
                            self.advance_stage(job, JobStage::UpdateScore).await?;
                        } else if is_sent {
                            self.advance_stage(job, JobStage::WaitAcceptance).await?;
                        } else if age_exceeds(sent_at, self.config.confirm_timeout_seconds) {
                            tracing::warn!(job_id = %job.id, "Friend request never confirmed upstream");
                            self.db
                                .requeue_or_fail_job(&job.id, "friend request not confirmed upstream")
                                .await?;
                        }
                    }
                }
            }
            Some(JobStage::WaitAcceptance) => {
                if is_friend {
                    self.advance_stage(job, JobStage::UpdateScore).await?;
                } else if is_pending {
                    // The target sent a request of their own instead of
                    // accepting ours; accepting it forms the friendship
                    // and consumes a friend slot.
                    if *slots == 0 {
                        return Ok(());
                    }
                    self.portal.accept_friend_request(code).await?;
                    *slots -= 1;
                    self.advance_stage(job, JobStage::UpdateScore).await?;
                } else if job
                    .request_sent_at
                    .map(|at| age_exceeds(at, self.config.acceptance_timeout_seconds))
                    .unwrap_or(false)
                {
                    tracing::warn!(job_id = %job.id, "Friend request not accepted in time");
                    if is_sent {
                        self.portal.cancel_friend_request(code).await.ok();
                    }
                    self.db
                        .requeue_or_fail_job(&job.id, "friend request not accepted in time")
                        .await?;
                }
            }
            Some(JobStage::UpdateScore) => {
                if !job.skip_update_score {
                    // Comparison pages are only served for favorites.
                    self.portal.set_favorite(code, true).await?;
                    let scraped = self.scraper.scrape(job).await;
                    self.portal.set_favorite(code, false).await.ok();
                    scraped?;
                }

                let patch = JobPatch {
                    status: Some(JobStatus::Completed.as_str().to_string()),
                    executing: Some(false),
                    ..Default::default()
                };
                self.db.patch_job(&job.id, &patch).await?;
                tracing::info!(job_id = %job.id, friend_code = %code, "Job completed");

                // The friendship existed only for this job.
                if is_friend {
                    self.portal.drop_friend(code).await.ok();
                }
            }
            None => {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "job {} has unknown stage {}",
                    job.id,
                    job.stage
                )));
            }
        }

        Ok(())
    }

    /// Claim queued jobs while slots remain and the queue is healthy
    async fn drain_queued(&self, slots: &mut usize) -> Result<(), AppError> {
        while *slots > 0 {
            if self.portal.is_saturated() {
                tracing::warn!("Fetch queue saturated, deferring new claims");
                break;
            }

            let Some(job) = self.db.claim_next_job(&self.config.bot_account_id).await? else {
                break;
            };
            tracing::info!(job_id = %job.id, friend_code = %job.friend_code, "Claimed job");

            match self.send_request(&job).await {
                Ok(()) => *slots -= 1,
                Err(error) => {
                    tracing::error!(job_id = %job.id, %error, "Send failed for claimed job");
                    self.db.fail_job(&job.id, &error.to_string()).await?;
                }
            }
        }
        Ok(())
    }

    /// Validate the target exists, then send the friend request and stamp
    /// the send time. The stage stays `send_request` until the portal
    /// confirms the request on a later tick.
    async fn send_request(&self, job: &Job) -> Result<(), AppError> {
        let code = job.friend_code.as_str();

        let known = {
            let cache = self.validated_codes.lock().unwrap_or_else(|e| e.into_inner());
            cache.contains(code)
        };
        if !known {
            let Some(player) = self.portal.lookup_friend_code(code).await? else {
                return Err(AppError::Validation(format!(
                    "friend code {} does not exist upstream",
                    code
                )));
            };
            tracing::debug!(friend_code = %code, player = %player, "Friend code validated");
            let mut cache = self.validated_codes.lock().unwrap_or_else(|e| e.into_inner());
            cache.insert(code.to_string());
        }

        self.portal.send_friend_request(code).await?;

        let patch = JobPatch {
            request_sent_at: Some(Utc::now()),
            ..Default::default()
        };
        self.db.patch_job(&job.id, &patch).await?;
        Ok(())
    }

    async fn advance_stage(&self, job: &Job, stage: JobStage) -> Result<(), AppError> {
        let patch = JobPatch {
            stage: Some(stage.as_str().to_string()),
            ..Default::default()
        };
        self.db.patch_job(&job.id, &patch).await?;
        tracing::info!(job_id = %job.id, stage = stage.as_str(), "Stage advanced");
        Ok(())
    }
}

fn age_exceeds(at: chrono::DateTime<Utc>, seconds: u64) -> bool {
    Utc::now().signed_duration_since(at).num_seconds() >= seconds as i64
}
