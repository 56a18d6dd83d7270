//! Cookie jars
//!
//! One session-cookie bag per bot account, persisted in SQLite.
//! Callers treat a jar as opaque: they attach it to requests and merge
//! whatever `Set-Cookie` rotations the upstream sends back.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{CookieJarRecord, Database};
use crate::error::AppError;

/// A single cookie value with its expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieEntry {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

/// In-memory bag of session cookies for one account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieJar {
    cookies: BTreeMap<String, CookieEntry>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Value of a cookie, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|entry| entry.value.as_str())
    }

    /// Insert or replace a cookie
    pub fn set(&mut self, name: &str, value: &str, expires_at: DateTime<Utc>) {
        self.cookies.insert(
            name.to_string(),
            CookieEntry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    /// Render the jar as a `Cookie` request header value
    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, entry)| format!("{}={}", name, entry.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Merge `Set-Cookie` response headers into the jar.
    ///
    /// The upstream rotates its session cookie on most responses, so every
    /// observed mutation must be captured. Returns true if anything changed.
    pub fn merge_set_cookies<'a, I>(&mut self, headers: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut changed = false;
        for header in headers {
            let Some((name, value)) = parse_set_cookie(header) else {
                continue;
            };
            let replaced = self.get(&name) != Some(value.as_str());
            if replaced {
                self.set(&name, &value, far_future());
                changed = true;
            }
        }
        changed
    }

    /// Merge another jar into this one (other wins on conflicts)
    pub fn merge(&mut self, other: &CookieJar) {
        for (name, entry) in &other.cookies {
            self.cookies.insert(name.clone(), entry.clone());
        }
    }
}

/// Expiry pinned far enough into the future that the store's own
/// expiry-pruning can never drop a freshly rotated cookie.
fn far_future() -> DateTime<Utc> {
    Utc::now() + Duration::days(365 * 10)
}

/// Extract the name/value pair from a `Set-Cookie` header, ignoring
/// attributes such as Path, HttpOnly and the upstream's own Expires.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// Database-backed cookie store, keyed by account identifier.
///
/// Writers always perform a full read-merge-write, so a lost race means the
/// next load sees the latest persisted jar rather than a corrupted one.
#[derive(Clone)]
pub struct CookieStore {
    db: Arc<Database>,
}

impl CookieStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Load the persisted jar for an account (empty jar if none)
    pub async fn load(&self, account_id: &str) -> Result<CookieJar, AppError> {
        match self.db.get_cookie_jar(account_id).await? {
            Some(record) => {
                let jar: CookieJar = serde_json::from_str(&record.cookies)
                    .map_err(|e| AppError::Internal(e.into()))?;
                Ok(jar)
            }
            None => Ok(CookieJar::new()),
        }
    }

    /// Persist `jar` for an account, merging over the stored bag.
    ///
    /// Every cookie's expiry is pinned far into the future at save time so
    /// recently issued cookies are never dropped by expiry-pruning.
    pub async fn save(&self, account_id: &str, jar: &CookieJar) -> Result<(), AppError> {
        let mut merged = self.load(account_id).await?;
        merged.merge(jar);
        for entry in merged.cookies.values_mut() {
            entry.expires_at = far_future();
        }

        let record = CookieJarRecord {
            account_id: account_id.to_string(),
            cookies: serde_json::to_string(&merged).map_err(|e| AppError::Internal(e.into()))?,
            updated_at: Utc::now(),
        };
        self.db.upsert_cookie_jar(&record).await?;

        tracing::debug!(account_id = %account_id, "Cookie jar persisted");
        Ok(())
    }

    /// Replace the stored jar outright (used after a fresh cookie exchange)
    pub async fn replace(&self, account_id: &str, jar: &CookieJar) -> Result<(), AppError> {
        let mut pinned = jar.clone();
        for entry in pinned.cookies.values_mut() {
            entry.expires_at = far_future();
        }

        let record = CookieJarRecord {
            account_id: account_id.to_string(),
            cookies: serde_json::to_string(&pinned).map_err(|e| AppError::Internal(e.into()))?,
            updated_at: Utc::now(),
        };
        self.db.upsert_cookie_jar(&record).await?;

        tracing::info!(account_id = %account_id, "Cookie jar replaced after exchange");
        Ok(())
    }
}
