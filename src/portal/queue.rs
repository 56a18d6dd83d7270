//! Rate-limited fetch queue
//!
//! Serializes every outbound call to the upstream portal through one
//! dispatch loop with fixed spacing. The cadence is the primary anti-abuse
//! defense and is independent of queue depth.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::cookies::{CookieJar, CookieStore};
use crate::error::AppError;

/// Cookie carrying the rotating anti-forgery token
pub const TOKEN_COOKIE: &str = "_t";

/// Maximum redirect hops followed manually per attempt
const MAX_REDIRECT_HOPS: usize = 10;

/// Retry behavior attached to an external call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Budget for transient upstream errors
    pub fn transient() -> Self {
        Self { max_attempts: 3 }
    }

    /// Budget while a concurrent cookie refresh is expected to land
    pub fn cookie_refresh() -> Self {
        Self { max_attempts: 10 }
    }
}

/// One outbound request to the portal
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    /// Form body for POST requests
    pub form: Vec<(String, String)>,
    /// Append the anti-forgery token from the jar to the form body
    pub append_token: bool,
    /// Per-call timeout, independent of the dispatch cadence
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url,
            form: Vec::new(),
            append_token: false,
            timeout,
        }
    }

    pub fn post(url: Url, form: Vec<(String, String)>, timeout: Duration) -> Self {
        Self {
            method: Method::POST,
            url,
            form,
            append_token: true,
            timeout,
        }
    }
}

/// Final response of a dispatched request
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// URL the request ultimately resolved to after redirects
    pub resolved_url: Url,
    pub body: String,
}

struct QueuedFetch {
    request: FetchRequest,
    respond: oneshot::Sender<Result<FetchResponse, AppError>>,
}

/// Handle for enqueueing requests; cheap to clone
#[derive(Clone)]
pub struct FetchQueueHandle {
    tx: mpsc::UnboundedSender<QueuedFetch>,
    depth: Arc<AtomicUsize>,
    high_water: usize,
}

/// Decrements the depth counter even if the waiting caller is cancelled
struct DepthGuard(Arc<AtomicUsize>);

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FetchQueueHandle {
    /// Enqueue a request and wait for its final outcome.
    ///
    /// # Errors
    /// Returns an error after the retry budget for the observed error class
    /// is exhausted, or if the queue has shut down.
    pub async fn enqueue(&self, request: FetchRequest) -> Result<FetchResponse, AppError> {
        let (respond, rx) = oneshot::channel();
        self.depth.fetch_add(1, Ordering::SeqCst);
        let _guard = DepthGuard(self.depth.clone());

        let queued = QueuedFetch { request, respond };
        if self.tx.send(queued).is_err() {
            return Err(AppError::Queue("fetch queue has shut down".to_string()));
        }

        rx.await
            .map_err(|_| AppError::Queue("fetch queue dropped the request".to_string()))?
    }

    /// Current number of requests waiting or in flight
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// True once depth passes the high-water mark; callers should defer
    /// new work until the backlog drains.
    pub fn is_saturated(&self) -> bool {
        self.depth() >= self.high_water
    }
}

/// Checks whether an account's persisted session still authenticates.
///
/// A lightweight authenticated GET to the portal home; any redirect away
/// from it means the session no longer holds. Shared by the dispatcher's
/// escalation check and the periodic session-health timer.
#[derive(Clone)]
pub struct SessionProbe {
    client: reqwest::Client,
    cookie_store: CookieStore,
    account_id: String,
    probe_url: Url,
}

impl SessionProbe {
    pub fn new(
        cookie_store: CookieStore,
        account_id: String,
        probe_url: Url,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            client,
            cookie_store,
            account_id,
            probe_url,
        })
    }

    /// True when the portal no longer honors the stored session.
    ///
    /// A missing or empty jar counts as expired.
    pub async fn is_expired(&self) -> bool {
        let jar = match self.cookie_store.load(&self.account_id).await {
            Ok(jar) => jar,
            Err(_) => return true,
        };
        if jar.is_empty() {
            return true;
        }

        let result = self
            .client
            .get(self.probe_url.clone())
            .header(http::header::COOKIE, jar.header_value())
            .send()
            .await;

        match result {
            Ok(response) => response.status().is_redirection(),
            // Network trouble is not evidence of an expired cookie.
            Err(_) => false,
        }
    }
}

/// Owns the dispatch loop state; consumed by [`FetchDispatcher::run`]
pub struct FetchDispatcher {
    rx: mpsc::UnboundedReceiver<QueuedFetch>,
    client: reqwest::Client,
    cookie_store: CookieStore,
    account_id: String,
    /// Path prefix of the portal's application-level error page
    error_path: String,
    probe: SessionProbe,
    dispatch_interval: Duration,
}

impl FetchDispatcher {
    /// Build a dispatcher and its enqueue handle.
    ///
    /// Redirects are disabled on the underlying client so every hop's
    /// `Set-Cookie` rotation is observed and the resolved URL is known.
    pub fn new(
        cookie_store: CookieStore,
        account_id: String,
        probe: SessionProbe,
        error_path: String,
        dispatch_interval: Duration,
        high_water: usize,
    ) -> Result<(FetchQueueHandle, FetchDispatcher), AppError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        let handle = FetchQueueHandle {
            tx,
            depth,
            high_water,
        };

        let dispatcher = FetchDispatcher {
            rx,
            client,
            cookie_store,
            account_id,
            error_path,
            probe,
            dispatch_interval,
        };

        Ok((handle, dispatcher))
    }

    /// Run the dispatch loop until every enqueue handle is dropped.
    ///
    /// Exactly one request executes per dispatch interval.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.dispatch_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let queued = match self.rx.try_recv() {
                Ok(queued) => queued,
                Err(mpsc::error::TryRecvError::Empty) => continue,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    tracing::info!("Fetch queue handles dropped; dispatch loop exiting");
                    return;
                }
            };

            let result = self.execute(&queued.request).await;
            if let Err(ref error) = result {
                tracing::warn!(url = %queued.request.url, %error, "Fetch failed");
            }
            // Caller may have given up (e.g. tick ended); nothing to do then.
            let _ = queued.respond.send(result);
        }
    }

    /// Execute one request with the tiered retry policy.
    ///
    /// The whole call, retries and cadence sleeps included, runs against
    /// a deadline of the request's timeout. Error pages start on the
    /// transient budget; once the cookie probe reports an expired session
    /// the budget escalates to the refresh budget and the deadline
    /// restarts, since the call is now waiting out an external login
    /// rather than a slow page.
    async fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, AppError> {
        let mut policy = RetryPolicy::transient();
        let mut attempts = 0u32;
        let mut deadline = tokio::time::Instant::now() + request.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(AppError::Timeout(format!(
                    "request to {} exceeded its deadline after {} attempts",
                    request.url, attempts
                )));
            }
            attempts += 1;

            let outcome = tokio::time::timeout(remaining, self.attempt(request)).await;

            match outcome {
                Err(_) => {
                    return Err(AppError::Timeout(format!(
                        "request to {} timed out after {} attempts",
                        request.url, attempts
                    )));
                }
                Ok(Err(error)) => {
                    if attempts >= policy.max_attempts {
                        return Err(error);
                    }
                    tracing::debug!(url = %request.url, %error, attempt = attempts, "Retrying after transient error");
                }
                Ok(Ok(response)) => {
                    if !self.is_error_page(&response) {
                        return Ok(response);
                    }

                    if policy == RetryPolicy::transient() && self.probe.is_expired().await {
                        tracing::info!(
                            account_id = %self.account_id,
                            "Session cookie expired; escalating retry budget while awaiting refresh"
                        );
                        policy = RetryPolicy::cookie_refresh();
                        deadline = tokio::time::Instant::now() + request.timeout;
                    }

                    if attempts >= policy.max_attempts {
                        if policy == RetryPolicy::cookie_refresh() {
                            return Err(AppError::CookieExpired(self.account_id.clone()));
                        }
                        return Err(AppError::Upstream(format!(
                            "portal error page for {} after {} attempts",
                            request.url, attempts
                        )));
                    }
                }
            }

            // Retries respect the same cadence as fresh dispatches.
            tokio::time::sleep(self.dispatch_interval).await;
        }
    }

    /// One attempt: follow redirects manually, merging every observed
    /// `Set-Cookie` into the jar and persisting mutations.
    async fn attempt(&self, request: &FetchRequest) -> Result<FetchResponse, AppError> {
        let mut jar = self.cookie_store.load(&self.account_id).await?;
        let jar_before = jar.clone();

        let mut url = request.url.clone();
        let mut method = request.method.clone();
        let mut response = None;

        for _hop in 0..MAX_REDIRECT_HOPS {
            let mut builder = self.client.request(method.clone(), url.clone());
            if !jar.is_empty() {
                builder = builder.header(http::header::COOKIE, jar.header_value());
            }
            if method == Method::POST {
                let mut form = request.form.clone();
                if request.append_token {
                    if let Some(token) = jar.get(TOKEN_COOKIE) {
                        form.push(("token".to_string(), token.to_string()));
                    }
                }
                builder = builder.form(&form);
            }

            let hop_response = builder.send().await?;

            let set_cookies: Vec<String> = hop_response
                .headers()
                .get_all(http::header::SET_COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok().map(str::to_string))
                .collect();
            jar.merge_set_cookies(set_cookies.iter().map(String::as_str));

            if hop_response.status().is_redirection() {
                let location = hop_response
                    .headers()
                    .get(http::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        AppError::Upstream("redirect without Location header".to_string())
                    })?;
                url = url
                    .join(location)
                    .map_err(|e| AppError::Upstream(format!("bad redirect target: {}", e)))?;
                // Redirects are followed as GET, like a browser would.
                method = Method::GET;
                continue;
            }

            response = Some(hop_response);
            break;
        }

        let response = response
            .ok_or_else(|| AppError::Upstream("too many redirects from portal".to_string()))?;

        let status = response.status().as_u16();
        let resolved_url = response.url().clone();
        let body = response.text().await?;

        // Opportunistically persist whatever rotation the upstream sent.
        if jar != jar_before {
            self.cookie_store.save(&self.account_id, &jar).await?;
        }

        Ok(FetchResponse {
            status,
            resolved_url,
            body,
        })
    }

    fn is_error_page(&self, response: &FetchResponse) -> bool {
        response.resolved_url.path().starts_with(&self.error_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policies_match_error_classes() {
        assert_eq!(RetryPolicy::transient().max_attempts, 3);
        assert_eq!(RetryPolicy::cookie_refresh().max_attempts, 10);
    }

    #[test]
    fn post_requests_carry_the_token() {
        let request = FetchRequest::post(
            Url::parse("https://portal.example.net/friend/invite/").unwrap(),
            vec![("idx".to_string(), "634142510810999".to_string())],
            Duration::from_secs(30),
        );
        assert!(request.append_token);
        assert_eq!(request.method, Method::POST);
    }

    #[tokio::test]
    async fn saturation_tracks_depth() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = FetchQueueHandle {
            tx,
            depth: Arc::new(AtomicUsize::new(0)),
            high_water: 2,
        };

        assert!(!handle.is_saturated());
        handle.depth.store(2, Ordering::SeqCst);
        assert!(handle.is_saturated());
    }
}
