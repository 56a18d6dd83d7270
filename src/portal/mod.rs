//! Upstream portal access
//!
//! - `queue`: rate-limited fetch queue serializing all upstream traffic
//! - `client`: typed friend/favorite/comparison operations
//! - `pages`: HTML normalization for the portal's pages

mod client;
pub mod pages;
mod queue;

pub use client::PortalClient;
pub use queue::{
    FetchDispatcher, FetchQueueHandle, FetchRequest, FetchResponse, RetryPolicy, SessionProbe,
    TOKEN_COOKIE,
};
