//! Tracker collaboration: registering the local catalog and asking which
//! peers hold a file.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::descriptor::FileDescriptor;
use crate::error::{PairError, Result};
use crate::identity::Identity;

pub mod http;
pub mod memory;
pub mod message;

pub use http::HttpTracker;
pub use memory::MemoryTracker;
pub use message::{PeerRecord, RegisterAck};

pub trait TrackerClient: Send + Sync {
    /// Sends the signed catalog of this node. Registering the same catalog
    /// twice is harmless.
    fn register(
        &self,
        identity: &Identity,
        advertised: SocketAddr,
        catalog: &[FileDescriptor],
    ) -> impl Future<Output = Result<RegisterAck>> + Send;

    /// Peers advertising `file`, in tracker order. An empty list is a valid
    /// answer, not an error.
    fn find_peers(&self, file: &str) -> impl Future<Output = Result<Vec<PeerRecord>>> + Send;

    /// Files whose name contains `keyword`, ignoring case.
    fn search(&self, keyword: &str) -> impl Future<Output = Result<Vec<FileDescriptor>>> + Send;

    /// Withdraws every registration of this node.
    fn sign_out(
        &self,
        identity: &Identity,
        advertised: SocketAddr,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Transport-level failures are worth another attempt; a tracker that
/// answered with a refusal or garbage is not.
fn is_retryable(err: &PairError) -> bool {
    matches!(err, PairError::Io(_))
}

/// Runs `op` until it succeeds, the error is not retryable, or the policy's
/// attempts are spent. Each attempt is bounded by `timeout`; the wait between
/// attempts doubles every time.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.tracker_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let outcome = match tokio::time::timeout(timeout, op()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PairError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{what} timed out after {timeout:?}"),
            ))),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(what, attempt, "tracker call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if is_retryable(&e) => {
                warn!(what, attempt, error = %e, "tracker call failed");
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(PairError::TrackerUnreachable {
        attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            tracker_attempts: attempts,
            tracker_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(&fast_policy(3), Duration::from_secs(1), "query", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PairError::Io(std::io::Error::other("refused")))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> =
            with_retry(&fast_policy(3), Duration::from_secs(1), "register", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PairError::Io(std::io::Error::other("refused")))
            })
            .await;

        assert_matches!(result, Err(PairError::TrackerUnreachable { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refusal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> =
            with_retry(&fast_policy(5), Duration::from_secs(1), "register", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PairError::Tracker("bad signature".into()))
            })
            .await;

        assert_matches!(result, Err(PairError::Tracker(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let result: Result<()> =
            with_retry(&fast_policy(2), Duration::from_millis(20), "query", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_matches!(
            result,
            Err(PairError::TrackerUnreachable { attempts: 2, last_error }) if last_error.contains("timed out")
        );
    }
}
