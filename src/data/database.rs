//! SQLite database operations
//!
//! All database access goes through this module.
//! Holds the job store (lifecycle, atomic claim, staleness sweep)
//! and the persisted cookie jars.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to the SQLite database at `path`, creating it if missing,
    /// and run pending migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Database(e.into()))?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Access the raw pool (tests only)
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Create a new job for `friend_code`.
    ///
    /// Rejected with [`AppError::CooldownActive`] if another job for the same
    /// code was created within `cooldown`. Otherwise any prior non-terminal
    /// job for the code is canceled before the new one is inserted.
    pub async fn create_job(
        &self,
        friend_code: &str,
        skip_update_score: bool,
        cooldown: Duration,
    ) -> Result<Job, AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let recent_created_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT created_at FROM jobs WHERE friend_code = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(friend_code)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(created_at) = recent_created_at {
            if now - created_at < cooldown {
                return Err(AppError::CooldownActive);
            }
        }

        let canceled = sqlx::query(
            "UPDATE jobs SET status = 'canceled', executing = 0, updated_at = ? \
             WHERE friend_code = ? AND status IN ('queued', 'processing')",
        )
        .bind(now)
        .bind(friend_code)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if canceled > 0 {
            tracing::info!(
                friend_code = %friend_code,
                canceled,
                "Auto-canceled prior live jobs for friend code"
            );
        }

        let job = Job {
            id: EntityId::new().0,
            friend_code: friend_code.to_string(),
            skip_update_score,
            bot_account_id: None,
            status: JobStatus::Queued.as_str().to_string(),
            stage: JobStage::SendRequest.as_str().to_string(),
            request_sent_at: None,
            completed_tiers: "[]".to_string(),
            result: None,
            error: None,
            requeued: false,
            executing: false,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO jobs (id, friend_code, skip_update_score, bot_account_id, status, stage, \
             request_sent_at, completed_tiers, result, error, requeued, executing, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.friend_code)
        .bind(job.skip_update_score)
        .bind(&job.bot_account_id)
        .bind(&job.status)
        .bind(&job.stage)
        .bind(job.request_sent_at)
        .bind(&job.completed_tiers)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.requeued)
        .bind(job.executing)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(job)
    }

    /// Fetch a job by id
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, AppError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Atomically claim the oldest queued job for `bot_account_id`.
    ///
    /// A single conditional UPDATE transitions queued -> processing and sets
    /// `executing = 1`; the WHERE clause re-checks both conditions so two
    /// concurrent callers can never claim the same job.
    pub async fn claim_next_job(&self, bot_account_id: &str) -> Result<Option<Job>, AppError> {
        let job = sqlx::query_as::<_, Job>(
            "UPDATE jobs SET status = 'processing', executing = 1, bot_account_id = ?, updated_at = ? \
             WHERE id = (SELECT id FROM jobs WHERE status = 'queued' AND executing = 0 \
                         ORDER BY created_at ASC LIMIT 1) \
               AND status = 'queued' AND executing = 0 \
             RETURNING *",
        )
        .bind(bot_account_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref job) = job {
            tracing::debug!(job_id = %job.id, bot_account_id = %bot_account_id, "Claimed job");
        }

        Ok(job)
    }

    /// Atomically claim one specific queued job for `bot_account_id`.
    ///
    /// Used when the target acted first and their request is already
    /// pending acceptance. Same conditional-UPDATE guarantee as
    /// [`claim_next_job`](Self::claim_next_job); returns `None` when the
    /// job is no longer claimable.
    pub async fn claim_job(&self, id: &str, bot_account_id: &str) -> Result<Option<Job>, AppError> {
        let job = sqlx::query_as::<_, Job>(
            "UPDATE jobs SET status = 'processing', executing = 1, bot_account_id = ?, updated_at = ? \
             WHERE id = ? AND status = 'queued' AND executing = 0 \
             RETURNING *",
        )
        .bind(bot_account_id)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Refresh `updated_at` on a job a worker is actively driving, so the
    /// staleness sweep only fires for jobs nothing is driving anymore.
    pub async fn touch_job(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply a validated partial update and return the new snapshot.
    ///
    /// Field-level validation happens in [`JobPatch::validate`]; this method
    /// merges present fields into the stored row.
    pub async fn patch_job(&self, id: &str, patch: &JobPatch) -> Result<Job, AppError> {
        patch.validate()?;

        let mut tx = self.pool.begin().await?;

        let mut job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AppError::NotFound)?;

        if let Some(ref bot_account_id) = patch.bot_account_id {
            job.bot_account_id = Some(bot_account_id.clone());
        }
        if let Some(ref status) = patch.status {
            job.status = status.clone();
        }
        if let Some(ref stage) = patch.stage {
            job.stage = stage.clone();
        }
        if let Some(request_sent_at) = patch.request_sent_at {
            job.request_sent_at = Some(request_sent_at);
        }
        if let Some(ref tiers) = patch.completed_tiers {
            job.completed_tiers =
                serde_json::to_string(tiers).map_err(|e| AppError::Internal(e.into()))?;
        }
        if let Some(ref result) = patch.result {
            job.result =
                Some(serde_json::to_string(result).map_err(|e| AppError::Internal(e.into()))?);
        }
        if let Some(ref error) = patch.error {
            job.error = Some(error.clone());
        }
        if let Some(executing) = patch.executing {
            job.executing = executing;
        }
        job.updated_at = Utc::now();

        sqlx::query(
            "UPDATE jobs SET bot_account_id = ?, status = ?, stage = ?, request_sent_at = ?, \
             completed_tiers = ?, result = ?, error = ?, executing = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&job.bot_account_id)
        .bind(&job.status)
        .bind(&job.stage)
        .bind(job.request_sent_at)
        .bind(&job.completed_tiers)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.executing)
        .bind(job.updated_at)
        .bind(&job.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(job)
    }

    /// Requeue a job after its first stage timeout, or fail it on repeat.
    ///
    /// Returns the job after the transition.
    pub async fn requeue_or_fail_job(&self, id: &str, reason: &str) -> Result<Job, AppError> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AppError::NotFound)?;

        let now = Utc::now();
        let job = if job.requeued {
            sqlx::query_as::<_, Job>(
                "UPDATE jobs SET status = 'failed', error = ?, executing = 0, updated_at = ? \
                 WHERE id = ? RETURNING *",
            )
            .bind(format!("{} (after requeue)", reason))
            .bind(now)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_as::<_, Job>(
                "UPDATE jobs SET status = 'queued', stage = 'send_request', request_sent_at = NULL, \
                 requeued = 1, executing = 0, updated_at = ? WHERE id = ? RETURNING *",
            )
            .bind(now)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
        };

        tx.commit().await?;
        Ok(job)
    }

    /// Mark a job failed with a human-readable message
    pub async fn fail_job(&self, id: &str, error: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', error = ?, executing = 0, updated_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear `executing` on jobs whose last update is older than `timeout`.
    ///
    /// Recovers from a worker crash mid-tick; status and stage are left
    /// unchanged. Returns the number of recovered jobs.
    pub async fn sweep_stale_executing(&self, timeout: Duration) -> Result<u64, AppError> {
        let cutoff = Utc::now() - timeout;
        let swept = sqlx::query("UPDATE jobs SET executing = 0 WHERE executing = 1 AND updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if swept > 0 {
            tracing::warn!(swept, "Cleared stale executing markers");
        }

        Ok(swept)
    }

    /// All jobs that can still make progress (queued or processing)
    pub async fn live_jobs(&self) -> Result<Vec<Job>, AppError> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE status IN ('queued', 'processing') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    // =========================================================================
    // Cookie jars
    // =========================================================================

    /// Fetch the persisted cookie bag for an account
    pub async fn get_cookie_jar(&self, account_id: &str) -> Result<Option<CookieJarRecord>, AppError> {
        let record =
            sqlx::query_as::<_, CookieJarRecord>("SELECT * FROM cookie_jars WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    /// Insert or replace the cookie bag for an account
    pub async fn upsert_cookie_jar(&self, record: &CookieJarRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO cookie_jars (account_id, cookies, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(account_id) DO UPDATE SET cookies = excluded.cookies, \
             updated_at = excluded.updated_at",
        )
        .bind(&record.account_id)
        .bind(&record.cookies)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
