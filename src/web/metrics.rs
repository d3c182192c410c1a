use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::OnceCell;

static STARTED_AT: OnceCell<Instant> = OnceCell::new();
static LOGINS_SUCCEEDED: AtomicU64 = AtomicU64::new(0);
static LOGINS_FAILED: AtomicU64 = AtomicU64::new(0);
static TOKENS_REFRESHED: AtomicU64 = AtomicU64::new(0);
static AUTH_REJECTED: AtomicU64 = AtomicU64::new(0);

pub struct Metrics;

impl Metrics {
    /// Starts the uptime clock; later calls keep the first instant.
    pub fn mark_started() {
        let _ = STARTED_AT.set(Instant::now());
    }

    pub fn login_succeeded() {
        LOGINS_SUCCEEDED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn login_failed() {
        LOGINS_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn token_refreshed() {
        TOKENS_REFRESHED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_rejected() {
        AUTH_REJECTED.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn format_prometheus() -> String {
    let uptime = STARTED_AT
        .get()
        .map(|started| started.elapsed().as_secs())
        .unwrap_or(0);

    format!(
        r#"# HELP shiftwise_uptime_seconds Number of seconds the server has been running
# TYPE shiftwise_uptime_seconds gauge
shiftwise_uptime_seconds {}

# HELP shiftwise_logins_succeeded_total Successful password logins
# TYPE shiftwise_logins_succeeded_total counter
shiftwise_logins_succeeded_total {}

# HELP shiftwise_logins_failed_total Logins rejected for bad credentials or inactive accounts
# TYPE shiftwise_logins_failed_total counter
shiftwise_logins_failed_total {}

# HELP shiftwise_tokens_refreshed_total Token pairs issued from a refresh token
# TYPE shiftwise_tokens_refreshed_total counter
shiftwise_tokens_refreshed_total {}

# HELP shiftwise_auth_rejected_total Requests rejected by bearer authentication
# TYPE shiftwise_auth_rejected_total counter
shiftwise_auth_rejected_total {}
"#,
        uptime,
        LOGINS_SUCCEEDED.load(Ordering::Relaxed),
        LOGINS_FAILED.load(Ordering::Relaxed),
        TOKENS_REFRESHED.load(Ordering::Relaxed),
        AUTH_REJECTED.load(Ordering::Relaxed),
    )
}
