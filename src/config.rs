use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024;
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7878";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const TRACKER_ATTEMPTS: u32 = 4;
const TRACKER_BACKOFF: Duration = Duration::from_millis(500);
const MAX_CHUNK_ATTEMPTS: u32 = 3;
const MAX_PASSES: u32 = 5;
const REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Upper bounds for every wait on the network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub handshake: Duration,
    pub request: Duration,
    pub tracker: Duration,
    /// How long a serving session waits for the next request.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: CONNECT_TIMEOUT,
            handshake: HANDSHAKE_TIMEOUT,
            request: REQUEST_TIMEOUT,
            tracker: TRACKER_TIMEOUT,
            idle: IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tracker attempts, including the first one.
    pub tracker_attempts: u32,
    /// Delay before the second tracker attempt; doubles after every failure.
    pub tracker_backoff: Duration,
    /// How many times a single chunk may be requested within one session.
    pub max_chunk_attempts: u32,
    /// How many assignment passes a download session runs before giving up.
    pub max_passes: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tracker_attempts: TRACKER_ATTEMPTS,
            tracker_backoff: TRACKER_BACKOFF,
            max_chunk_attempts: MAX_CHUNK_ATTEMPTS,
            max_passes: MAX_PASSES,
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the `failures`-th consecutive tracker failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.tracker_backoff.saturating_mul(factor)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// Address other peers should dial; defaults to the bound listener address.
    pub advertised_addr: Option<SocketAddr>,
    pub tracker_url: Option<String>,
    pub chunk_size: u64,
    /// Fallback re-registration period when the tracker does not name one.
    pub refresh_interval: Duration,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 7878))),
            advertised_addr: None,
            tracker_url: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            refresh_interval: REFRESH_INTERVAL,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
        }
    }
}
