//! Session cookie exchange
//!
//! Turns a hijacked OAuth callback URL into a persisted cookie jar.
//! The proxy never forwards the callback to the real client; instead this
//! module performs its own authenticated fetch of the callback URL with a
//! fresh jar, collects the session cookie the portal issues along the
//! redirect chain, and resolves which account the session belongs to.

use url::Url;

use crate::cookies::{CookieJar, CookieStore};
use crate::error::AppError;
use crate::portal::pages;

/// Maximum redirect hops followed during the exchange
const MAX_EXCHANGE_HOPS: usize = 10;

/// Performs callback-to-cookie exchanges and jar persistence
#[derive(Clone)]
pub struct SessionExchange {
    client: reqwest::Client,
    cookie_store: CookieStore,
    /// Profile page used to resolve the session's own friend code
    profile_url: Url,
}

impl SessionExchange {
    pub fn new(cookie_store: CookieStore, portal_base: &Url) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        let profile_url = portal_base
            .join("home/profile/")
            .map_err(|e| AppError::Internal(anyhow::anyhow!("bad profile path: {}", e)))?;

        Ok(Self {
            client,
            cookie_store,
            profile_url,
        })
    }

    /// Exchange a callback URL for a session jar and persist it.
    ///
    /// Returns the resolved friend code the jar was stored under.
    ///
    /// # Errors
    /// Fails if the portal does not issue a session cookie, or if the
    /// follow-up profile fetch cannot resolve a friend code.
    pub async fn exchange(&self, callback_url: &Url) -> Result<String, AppError> {
        let mut jar = CookieJar::new();
        self.fetch_into_jar(callback_url.clone(), &mut jar).await?;

        if jar.is_empty() {
            return Err(AppError::Proxy(
                "callback exchange yielded no session cookie".to_string(),
            ));
        }

        let friend_code = self.resolve_friend_code(&mut jar).await?;
        self.cookie_store.replace(&friend_code, &jar).await?;

        tracing::info!(friend_code = %friend_code, "Session cookie harvested");
        Ok(friend_code)
    }

    /// Follow the redirect chain from `url`, merging every `Set-Cookie`
    /// into `jar`. Returns the final response body.
    async fn fetch_into_jar(&self, mut url: Url, jar: &mut CookieJar) -> Result<String, AppError> {
        for _hop in 0..MAX_EXCHANGE_HOPS {
            let mut builder = self.client.get(url.clone());
            if !jar.is_empty() {
                builder = builder.header(http::header::COOKIE, jar.header_value());
            }

            let response = builder.send().await?;

            let set_cookies: Vec<String> = response
                .headers()
                .get_all(http::header::SET_COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok().map(str::to_string))
                .collect();
            jar.merge_set_cookies(set_cookies.iter().map(String::as_str));

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(http::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| AppError::Proxy("redirect without Location".to_string()))?;
                url = url
                    .join(location)
                    .map_err(|e| AppError::Proxy(format!("bad redirect target: {}", e)))?;
                continue;
            }

            return Ok(response.text().await?);
        }

        Err(AppError::Proxy(
            "too many redirects during cookie exchange".to_string(),
        ))
    }

    /// Resolve which account the fresh session belongs to
    async fn resolve_friend_code(&self, jar: &mut CookieJar) -> Result<String, AppError> {
        let body = self.fetch_into_jar(self.profile_url.clone(), jar).await?;
        pages::parse_own_friend_code(&body).ok_or_else(|| {
            AppError::Proxy("profile page did not contain a friend code".to_string())
        })
    }
}
