//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite job store (lifecycle, atomic claim, staleness sweep)
//! - Persisted cookie jars

mod database;
mod models;

pub use database::Database;
pub use models::*;
