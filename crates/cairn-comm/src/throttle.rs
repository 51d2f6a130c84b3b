//! Flow control — byte accounting and token-bucket admission.
//!
//! Each outbound packet costs its wire size in tokens. An empty bucket
//! delays the sender; a wait that cannot finish inside the caller's limit
//! fails instead of blocking the transfer forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Transfer accounting. Implementations are called on every admission and
/// receipt and must not block.
pub trait ByteCounter: Send + Sync {
    fn sent_bytes(&self, n: usize);
    fn received_bytes(&self, n: usize);
}

/// Plain atomic tallies.
#[derive(Debug, Default)]
pub struct TallyCounter {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TallyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl ByteCounter for TallyCounter {
    fn sent_bytes(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn received_bytes(&self, n: usize) {
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    #[error("throttle admission would exceed the wait limit")]
    WaitedTooLong,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Token-bucket admission in bytes per second.
#[derive(Debug)]
pub struct BandwidthThrottle {
    bucket: Mutex<Bucket>,
}

impl BandwidthThrottle {
    /// `rate` bytes/sec refill, `burst` bytes capacity. The bucket starts
    /// full.
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst,
                capacity: burst,
                rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A throttle that admits everything immediately.
    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY, f64::INFINITY)
    }

    /// Throttle configured from the comm settings.
    pub fn from_config(config: &crate::config::CommConfig) -> Self {
        Self::new(config.throttle_rate, config.throttle_burst)
    }

    /// Wait until `bytes` tokens are available, up to `limit`. An admission
    /// that cannot complete within the limit fails without consuming
    /// tokens.
    pub async fn acquire(&self, bytes: usize, limit: Duration) -> Result<(), ThrottleError> {
        let deadline = Instant::now() + limit;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().expect("throttle lock poisoned");
                let now = Instant::now();
                bucket.refill(now);
                let need = bytes as f64;
                if bucket.tokens >= need {
                    bucket.tokens -= need;
                    return Ok(());
                }
                Duration::from_secs_f64((need - bucket.tokens) / bucket.rate)
            };
            if Instant::now() + wait > deadline {
                return Err(ThrottleError::WaitedTooLong);
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Non-blocking admission, for callers that would rather drop.
    pub fn try_acquire(&self, bytes: usize) -> bool {
        let mut bucket = self.bucket.lock().expect("throttle lock poisoned");
        bucket.refill(Instant::now());
        let need = bytes as f64;
        if bucket.tokens >= need {
            bucket.tokens -= need;
            true
        } else {
            false
        }
    }
}
