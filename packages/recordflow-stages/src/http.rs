//! Shared HTTP plumbing: one client configuration and one failure
//! classification for every network-backed stage.

use recordflow_orchestration::ExecutorError;
use reqwest::StatusCode;
use std::time::Duration;

const USER_AGENT: &str = concat!("recordflow/", env!("CARGO_PKG_VERSION"));

/// Client shared by all executors in a run: connection pooling matters more
/// than per-stage tuning here. Per-attempt deadlines are enforced by the
/// orchestrator; the request timeout is a backstop.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, ExecutorError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(ExecutorError::permanent)
}

/// Map a response status onto the retry classification: throttling and
/// server errors are worth retrying, other client errors are not.
pub fn classify_status(status: StatusCode) -> Result<(), ExecutorError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(ExecutorError::transient(format!("http status {status}")))
    } else {
        Err(ExecutorError::permanent(format!("http status {status}")))
    }
}

/// Transport-level failures (connect, timeout, body) are all transient;
/// anything else from the client is a request-construction bug and permanent.
pub fn classify_transport(error: reqwest::Error) -> ExecutorError {
    if error.is_timeout() || error.is_connect() || error.is_body() || error.is_decode() {
        ExecutorError::transient(error)
    } else if error.is_builder() || error.is_request() {
        ExecutorError::permanent(error)
    } else {
        ExecutorError::transient(error)
    }
}
