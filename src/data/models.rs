//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Job status / stage
// =============================================================================

/// Lifecycle status of a Job
///
/// Moves only forward except explicit cancellation:
/// queued -> processing -> {completed | failed | canceled}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// True for completed, failed and canceled
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Sub-state of a processing Job describing which phase of the
/// friend-relationship lifecycle is in progress.
///
/// Strictly advances: send_request -> wait_acceptance -> update_score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    SendRequest,
    WaitAcceptance,
    UpdateScore,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendRequest => "send_request",
            Self::WaitAcceptance => "wait_acceptance",
            Self::UpdateScore => "update_score",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "send_request" => Some(Self::SendRequest),
            "wait_acceptance" => Some(Self::WaitAcceptance),
            "update_score" => Some(Self::UpdateScore),
            _ => None,
        }
    }
}

// =============================================================================
// Difficulty tiers
// =============================================================================

/// The five difficulty tiers a comparison page exists for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Basic,
    Advanced,
    Expert,
    Master,
    Remaster,
}

impl Difficulty {
    /// All tiers in scrape order
    pub const ALL: [Difficulty; 5] = [
        Self::Basic,
        Self::Advanced,
        Self::Expert,
        Self::Master,
        Self::Remaster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Advanced => "advanced",
            Self::Expert => "expert",
            Self::Master => "master",
            Self::Remaster => "remaster",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(Self::Basic),
            "advanced" => Some(Self::Advanced),
            "expert" => Some(Self::Expert),
            "master" => Some(Self::Master),
            "remaster" => Some(Self::Remaster),
            _ => None,
        }
    }

    /// Index used by the portal's difficulty query parameter
    pub fn portal_index(&self) -> u8 {
        match self {
            Self::Basic => 0,
            Self::Advanced => 1,
            Self::Expert => 2,
            Self::Master => 3,
            Self::Remaster => 4,
        }
    }
}

// =============================================================================
// Job
// =============================================================================

/// A scrape request for one target account
///
/// Retained forever as history; never deleted. Enum-valued columns are
/// stored as their string form and validated at every mutation boundary.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    /// External account identifier of the target player
    pub friend_code: String,
    /// Skip the update_score stage after the friendship forms
    pub skip_update_score: bool,
    /// Bot account that claimed this job
    pub bot_account_id: Option<String>,
    /// Status string: queued, processing, completed, failed, canceled
    pub status: String,
    /// Stage string: send_request, wait_acceptance, update_score
    pub stage: String,
    /// When the friend request was sent upstream
    pub request_sent_at: Option<DateTime<Utc>>,
    /// JSON array of difficulty names already scraped
    pub completed_tiers: String,
    /// Opaque result payload (JSON)
    pub result: Option<String>,
    /// Human-readable failure message
    pub error: Option<String>,
    /// Set once the job has been requeued after a stage timeout;
    /// a second timeout fails the job instead
    pub requeued: bool,
    /// Mutual-exclusion marker: at most one worker drives this job
    pub executing: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Typed view of the status column
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    /// Typed view of the stage column
    pub fn stage(&self) -> Option<JobStage> {
        JobStage::parse(&self.stage)
    }

    /// Tiers already scraped, in no particular order
    pub fn completed_tiers(&self) -> Vec<Difficulty> {
        serde_json::from_str::<Vec<String>>(&self.completed_tiers)
            .unwrap_or_default()
            .iter()
            .filter_map(|s| Difficulty::parse(s))
            .collect()
    }

}

/// Partial update for a Job
///
/// Every present field is validated against its declared enum/type
/// before anything is persisted; unknown status/stage values are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPatch {
    pub bot_account_id: Option<String>,
    pub status: Option<String>,
    pub stage: Option<String>,
    pub request_sent_at: Option<DateTime<Utc>>,
    pub completed_tiers: Option<Vec<String>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub executing: Option<bool>,
}

impl JobPatch {
    /// Validate enum-valued fields
    ///
    /// # Errors
    /// Returns a validation error naming the offending field.
    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        if let Some(ref status) = self.status {
            if JobStatus::parse(status).is_none() {
                return Err(crate::error::AppError::Validation(format!(
                    "unknown status value: {}",
                    status
                )));
            }
        }

        if let Some(ref stage) = self.stage {
            if JobStage::parse(stage).is_none() {
                return Err(crate::error::AppError::Validation(format!(
                    "unknown stage value: {}",
                    stage
                )));
            }
        }

        if let Some(ref tiers) = self.completed_tiers {
            for tier in tiers {
                if Difficulty::parse(tier).is_none() {
                    return Err(crate::error::AppError::Validation(format!(
                        "unknown difficulty tier: {}",
                        tier
                    )));
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// Cookie jar rows
// =============================================================================

/// Persisted cookie bag for one bot account
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CookieJarRecord {
    pub account_id: String,
    /// JSON map of cookie name -> {value, expires_at}
    pub cookies: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_known_values() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("exploded"), None);
    }

    #[test]
    fn stage_ordering_is_strict() {
        assert!(JobStage::SendRequest < JobStage::WaitAcceptance);
        assert!(JobStage::WaitAcceptance < JobStage::UpdateScore);
    }

    #[test]
    fn patch_rejects_unknown_status() {
        let patch = JobPatch {
            status: Some("paused".to_string()),
            ..Default::default()
        };
        assert!(patch.validate().is_err());
    }

    #[test]
    fn patch_rejects_unknown_tier() {
        let patch = JobPatch {
            completed_tiers: Some(vec!["basic".to_string(), "ultima".to_string()]),
            ..Default::default()
        };
        assert!(patch.validate().is_err());
    }

    #[test]
    fn completed_tiers_skips_unparseable_entries() {
        let job = Job {
            id: EntityId::new().0,
            friend_code: "634142510810999".to_string(),
            skip_update_score: false,
            bot_account_id: None,
            status: "queued".to_string(),
            stage: "send_request".to_string(),
            request_sent_at: None,
            completed_tiers: r#"["basic","bogus","master"]"#.to_string(),
            result: None,
            error: None,
            requeued: false,
            executing: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            job.completed_tiers(),
            vec![Difficulty::Basic, Difficulty::Master]
        );
    }
}
