//! Check executor
//!
//! Issues a single GET against an endpoint and classifies the outcome. A
//! failing endpoint produces a `CheckResult` with `success == false`; the
//! executor itself never errors.

use std::error::Error as _;
use std::time::{Duration, Instant};

use reqwest::{Client, Response, redirect};
use tracing::{debug, instrument, trace};

use crate::model::CheckResult;

/// Redirect hops followed before the request is treated as failed, the same
/// limit common browser-side HTTP clients use
const MAX_REDIRECTS: usize = 21;

/// Response bytes read before the rest of the body is dropped
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Timeout classification message
pub const TIMEOUT_MESSAGE: &str = "Request timed out";

/// HTTP probe shared by every check
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct EndpointChecker {
    client: Client,
}

impl Default for EndpointChecker {
    fn default() -> Self {
        let client = Client::builder()
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .unwrap_or_default();

        Self { client }
    }
}

impl EndpointChecker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Probe `url`, giving up after `timeout`
    ///
    /// Status codes in `[200, 400)` count as success. `response_time_ms` is
    /// measured for failures too and is only `None` when the request could not
    /// be built.
    #[instrument(skip(self))]
    pub async fn check(&self, url: &str, timeout: Duration) -> CheckResult {
        let request = match self.client.get(url).timeout(timeout).build() {
            Ok(request) => request,
            Err(e) => {
                debug!("could not build request: {e}");
                return CheckResult::failure(None, None, error_text(&e));
            }
        };

        let start = Instant::now();
        let outcome = match self.client.execute(request).await {
            Ok(response) => drain_body(response).await,
            Err(e) => Err(e),
        };
        let elapsed = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(status) if (200..400).contains(&status) => CheckResult::success(status, elapsed),
            Ok(status) => CheckResult::failure(
                Some(status),
                Some(elapsed),
                format!("Received status code {status}"),
            ),
            Err(e) if e.is_timeout() => CheckResult::failure(
                e.status().map(|s| s.as_u16()),
                Some(elapsed),
                TIMEOUT_MESSAGE,
            ),
            Err(e) => CheckResult::failure(
                e.status().map(|s| s.as_u16()),
                Some(elapsed),
                error_text(&e),
            ),
        };

        trace!(
            "{url} -> success={} status={:?} in {elapsed}ms",
            result.success, result.status_code
        );
        result
    }
}

/// Read up to `MAX_BODY_BYTES` of the body so the measurement covers the
/// transfer, then drop the connection
async fn drain_body(mut response: Response) -> reqwest::Result<u16> {
    let status = response.status().as_u16();
    let mut read = 0;
    while read < MAX_BODY_BYTES {
        match response.chunk().await? {
            Some(chunk) => read += chunk.len(),
            None => break,
        }
    }
    Ok(status)
}

/// Error message followed by each of its sources
fn error_text(err: &reqwest::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
