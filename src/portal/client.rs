//! Typed game-portal operations
//!
//! Every call goes through the rate-limited fetch queue; this module only
//! knows the portal's paths, form shapes and page formats. POST bodies
//! carry the rotating anti-forgery token, injected from the jar at
//! dispatch time.

use std::time::Duration;

use url::Url;

use super::pages;
use super::queue::{FetchQueueHandle, FetchRequest, FetchResponse};
use crate::data::Difficulty;
use crate::error::AppError;

/// Typed client for the upstream game portal
#[derive(Clone)]
pub struct PortalClient {
    queue: FetchQueueHandle,
    base_url: Url,
    request_timeout: Duration,
    page_timeout: Duration,
}

impl PortalClient {
    pub fn new(
        queue: FetchQueueHandle,
        base_url: Url,
        request_timeout: Duration,
        page_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            base_url,
            request_timeout,
            page_timeout,
        }
    }

    /// Saturation signal from the underlying queue
    pub fn is_saturated(&self) -> bool {
        self.queue.is_saturated()
    }

    fn url(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("bad portal path {}: {}", path, e)))
    }

    async fn get(&self, path: &str) -> Result<FetchResponse, AppError> {
        let url = self.url(path)?;
        self.queue
            .enqueue(FetchRequest::get(url, self.request_timeout))
            .await
    }

    async fn post(&self, path: &str, form: Vec<(String, String)>) -> Result<(), AppError> {
        let url = self.url(path)?;
        self.queue
            .enqueue(FetchRequest::post(url, form, self.request_timeout))
            .await?;
        Ok(())
    }

    /// Current friends of the bot account
    pub async fn friend_list(&self) -> Result<Vec<String>, AppError> {
        let response = self.get("friend/").await?;
        Ok(pages::parse_friend_codes(&response.body))
    }

    /// Friend requests the bot has sent and that are still outstanding
    pub async fn sent_requests(&self) -> Result<Vec<String>, AppError> {
        let response = self.get("friend/invite/").await?;
        Ok(pages::parse_friend_codes(&response.body))
    }

    /// Incoming requests awaiting the bot's acceptance
    pub async fn pending_acceptances(&self) -> Result<Vec<String>, AppError> {
        let response = self.get("friend/request/").await?;
        Ok(pages::parse_friend_codes(&response.body))
    }

    /// Look a friend code up; returns the player name on a hit.
    ///
    /// Used to validate a target before spending a friend-request slot.
    pub async fn lookup_friend_code(&self, friend_code: &str) -> Result<Option<String>, AppError> {
        let url = self.url(&format!("friend/search/?idx={}", friend_code))?;
        let response = self
            .queue
            .enqueue(FetchRequest::get(url, self.request_timeout))
            .await?;
        Ok(pages::parse_search_hit(&response.body))
    }

    /// Send a friend request to the target account
    pub async fn send_friend_request(&self, friend_code: &str) -> Result<(), AppError> {
        self.post(
            "friend/search/invite/",
            vec![("idx".to_string(), friend_code.to_string())],
        )
        .await?;
        tracing::info!(friend_code = %friend_code, "Sent friend request");
        Ok(())
    }

    /// Cancel a friend request the bot sent earlier
    pub async fn cancel_friend_request(&self, friend_code: &str) -> Result<(), AppError> {
        self.post(
            "friend/invite/cancel/",
            vec![("idx".to_string(), friend_code.to_string())],
        )
        .await?;
        tracing::info!(friend_code = %friend_code, "Canceled friend request");
        Ok(())
    }

    /// Accept an incoming friend request
    pub async fn accept_friend_request(&self, friend_code: &str) -> Result<(), AppError> {
        self.post(
            "friend/request/accept/",
            vec![("idx".to_string(), friend_code.to_string())],
        )
        .await?;
        tracing::info!(friend_code = %friend_code, "Accepted friend request");
        Ok(())
    }

    /// Block an account (used for orphan acceptances)
    pub async fn block_friend(&self, friend_code: &str) -> Result<(), AppError> {
        self.post(
            "friend/request/block/",
            vec![("idx".to_string(), friend_code.to_string())],
        )
        .await?;
        tracing::warn!(friend_code = %friend_code, "Blocked account");
        Ok(())
    }

    /// Drop an established friendship
    pub async fn drop_friend(&self, friend_code: &str) -> Result<(), AppError> {
        self.post(
            "friend/drop/",
            vec![("idx".to_string(), friend_code.to_string())],
        )
        .await?;
        tracing::info!(friend_code = %friend_code, "Dropped friendship");
        Ok(())
    }

    /// Toggle the favorite marker on a friend
    pub async fn set_favorite(&self, friend_code: &str, favorite: bool) -> Result<(), AppError> {
        let path = if favorite {
            "friend/favorite_on/"
        } else {
            "friend/favorite_off/"
        };
        self.post(path, vec![("idx".to_string(), friend_code.to_string())])
            .await
    }

    /// Fetch and normalize one half of a comparison page for a tier.
    ///
    /// The portal splits each tier's comparison across two pages; callers
    /// fetch both halves and concatenate.
    pub async fn fetch_comparison_page(
        &self,
        friend_code: &str,
        difficulty: Difficulty,
        page_index: u8,
    ) -> Result<Vec<pages::ScoreRow>, AppError> {
        let url = self.url(&format!(
            "friend/vs/?idx={}&diff={}&page={}",
            friend_code,
            difficulty.portal_index(),
            page_index
        ))?;
        let response = self
            .queue
            .enqueue(FetchRequest::get(url, self.page_timeout))
            .await?;
        pages::parse_comparison_rows(&response.body)
    }
}
