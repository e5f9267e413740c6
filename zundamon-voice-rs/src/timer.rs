//! Optional deadlines for `tokio::select!` loops.

use std::future::pending;

use tokio::time::{sleep_until, Instant};

/// Sleep until `at`, or forever when no deadline is set.
pub async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
