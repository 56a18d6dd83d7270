//! Per-tier score scraping
//!
//! Walks the five difficulty tiers of an established friendship, pulling
//! both halves of each comparison page and persisting results tier by
//! tier so an interrupted job resumes where it stopped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::WorkerConfig;
use crate::data::{Database, Difficulty, Job, JobPatch};
use crate::error::AppError;
use crate::portal::PortalClient;

/// Scrapes comparison scores for one job at a time
#[derive(Clone)]
pub struct ScoreScraper {
    db: Arc<Database>,
    portal: PortalClient,
    jitter_min: Duration,
    jitter_max: Duration,
}

impl ScoreScraper {
    pub fn new(db: Arc<Database>, portal: PortalClient, config: &WorkerConfig) -> Self {
        Self {
            db,
            portal,
            jitter_min: Duration::from_millis(config.jitter_min_ms),
            jitter_max: Duration::from_millis(config.jitter_max_ms),
        }
    }

    /// Scrape every tier the job has not completed yet.
    ///
    /// Progress is committed after each tier, so a crash mid-job costs at
    /// most one tier of work. Tiers are scraped in a fixed order with a
    /// randomized pause before each one.
    ///
    /// # Errors
    /// Propagates the first fetch or persistence failure; completed tiers
    /// stay recorded on the job.
    pub async fn scrape(&self, job: &Job) -> Result<(), AppError> {
        let done = job.completed_tiers();
        let mut results = existing_results(job);

        for tier in Difficulty::ALL {
            if done.contains(&tier) {
                tracing::debug!(job_id = %job.id, tier = tier.as_str(), "Tier already scraped, skipping");
                continue;
            }

            tokio::time::sleep(self.jitter()).await;

            // The portal splits each tier across two pages; fetch both
            // halves through the queue concurrently.
            let (first, second) = tokio::join!(
                self.portal
                    .fetch_comparison_page(&job.friend_code, tier, 0),
                self.portal
                    .fetch_comparison_page(&job.friend_code, tier, 1),
            );
            let mut rows = first?;
            rows.extend(second?);

            tracing::info!(
                job_id = %job.id,
                tier = tier.as_str(),
                rows = rows.len(),
                "Scraped comparison tier"
            );

            let rows_value = serde_json::to_value(&rows)
                .map_err(|e| AppError::Internal(e.into()))?;
            results.insert(tier.as_str().to_string(), rows_value);

            let mut completed: Vec<String> = results.keys().cloned().collect();
            completed.sort_by_key(|name| {
                Difficulty::parse(name).map(|d| d.portal_index()).unwrap_or(u8::MAX)
            });

            let patch = JobPatch {
                completed_tiers: Some(completed),
                result: Some(serde_json::Value::Object(
                    results.clone().into_iter().collect(),
                )),
                ..Default::default()
            };
            self.db.patch_job(&job.id, &patch).await?;
        }

        Ok(())
    }

    fn jitter(&self) -> Duration {
        if self.jitter_max <= self.jitter_min {
            return self.jitter_min;
        }
        let millis = rand::thread_rng()
            .gen_range(self.jitter_min.as_millis() as u64..=self.jitter_max.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// Per-tier results already stored on the job, keyed by tier name
fn existing_results(job: &Job) -> BTreeMap<String, serde_json::Value> {
    job.result
        .as_deref()
        .and_then(|raw| serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw).ok())
        .map(|map| map.into_iter().collect())
        .unwrap_or_default()
}
