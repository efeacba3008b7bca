//! Persistent per-client rate limiting

use crate::error::{FaucetError, FaucetResult};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sled::Tree;
use tracing::{debug, info};

const RECORD_LEN: usize = 12;

/// Requests seen from one client in its current window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub client_key: String,
    /// Requests observed in the current window, including the latest one
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

impl RateLimitRecord {
    /// Time left until the window resets, never negative
    pub fn remaining(&self, now: DateTime<Utc>, window: Duration) -> Duration {
        let left = self.window_start + window - now;
        if left < Duration::zero() {
            Duration::zero()
        } else {
            left
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.window_start > window
    }
}

/// On-disk form: big-endian count followed by the window start in unix millis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counter {
    count: u32,
    window_start_ms: i64,
}

impl Counter {
    fn encode(self) -> [u8; RECORD_LEN] {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[..4].copy_from_slice(&self.count.to_be_bytes());
        bytes[4..].copy_from_slice(&self.window_start_ms.to_be_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RECORD_LEN {
            return None;
        }
        let count = u32::from_be_bytes(bytes[..4].try_into().ok()?);
        let window_start_ms = i64::from_be_bytes(bytes[4..].try_into().ok()?);
        Some(Self {
            count,
            window_start_ms,
        })
    }

    /// The counter after observing one more request at `now_ms`.
    fn observe(previous: Option<Self>, now_ms: i64, window_ms: i64) -> Self {
        match previous {
            Some(prev) if now_ms - prev.window_start_ms <= window_ms => Self {
                count: prev.count.saturating_add(1),
                window_start_ms: prev.window_start_ms,
            },
            _ => Self {
                count: 1,
                window_start_ms: now_ms,
            },
        }
    }

    fn into_record(self, client_key: &str) -> FaucetResult<RateLimitRecord> {
        let window_start = Utc
            .timestamp_millis_opt(self.window_start_ms)
            .single()
            .ok_or_else(|| FaucetError::Serialization("Invalid window start".to_string()))?;
        Ok(RateLimitRecord {
            client_key: client_key.to_string(),
            count: self.count,
            window_start,
        })
    }
}

/// Fixed-window request counter keyed by client.
///
/// Each check is a single compare-and-swap on that client's key, so
/// concurrent requests from one client are serialized while different
/// clients never contend.
#[derive(Clone)]
pub struct RateLimiter {
    tree: Tree,
}

impl RateLimiter {
    pub(crate) fn new(tree: Tree) -> Self {
        Self { tree }
    }

    /// Count one request from `client_key` and return the updated record;
    /// its `count` is the observed request number within the window.
    ///
    /// A request arriving more than `window` after the window start opens a
    /// new window with a count of 1.
    pub async fn check_and_increment(
        &self,
        client_key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> FaucetResult<RateLimitRecord> {
        let tree = self.tree.clone();
        let key = client_key.as_bytes().to_vec();
        let now_ms = now.timestamp_millis();
        let window_ms = window.num_milliseconds();

        let updated = tokio::task::spawn_blocking(move || {
            tree.update_and_fetch(key, |old| {
                let previous = old.and_then(Counter::decode);
                Some(Counter::observe(previous, now_ms, window_ms).encode().to_vec())
            })
        })
        .await??;

        self.tree.flush_async().await?;

        let counter = updated
            .as_deref()
            .and_then(Counter::decode)
            .ok_or_else(|| FaucetError::Internal("Rate limit record vanished".to_string()))?;
        let record = counter.into_record(client_key)?;

        debug!("{} has value: {}", client_key, record.count);
        Ok(record)
    }

    /// Current record for a client, if any
    pub async fn get(&self, client_key: &str) -> FaucetResult<Option<RateLimitRecord>> {
        match self.tree.get(client_key.as_bytes())? {
            Some(bytes) => Counter::decode(&bytes)
                .map(|c| c.into_record(client_key))
                .transpose(),
            None => Ok(None),
        }
    }

    /// Drop records whose window ended before `now`. A record refreshed by a
    /// concurrent request between the scan and the delete is kept.
    pub async fn reap_expired(&self, now: DateTime<Utc>, window: Duration) -> FaucetResult<usize> {
        let tree = self.tree.clone();

        let removed = tokio::task::spawn_blocking(move || -> FaucetResult<usize> {
            let mut removed = 0;
            for item in tree.iter() {
                let (key, value) = item?;
                let expired = match Counter::decode(&value) {
                    Some(counter) => {
                        let client_key = String::from_utf8_lossy(&key);
                        counter.into_record(&client_key)?.is_expired(now, window)
                    }
                    // Unreadable records carry no information worth keeping.
                    None => true,
                };

                if expired && tree.compare_and_swap(&key, Some(&value), None as Option<&[u8]>)?.is_ok() {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await??;

        if removed > 0 {
            self.tree.flush_async().await?;
            info!("Reaped {} expired rate limit records", removed);
        }
        Ok(removed)
    }

    /// Number of tracked clients
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::FaucetDatabase;
    use std::sync::Arc;

    fn open_limiter() -> (tempfile::TempDir, RateLimiter) {
        let dir = tempfile::tempdir().unwrap();
        let db = FaucetDatabase::open(dir.path().join("db").to_str().unwrap()).unwrap();
        let limiter = db.rate_limiter().unwrap();
        (dir, limiter)
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_counter_encoding() {
        let counter = Counter {
            count: 7,
            window_start_ms: 1_714_564_800_000,
        };
        assert_eq!(Counter::decode(&counter.encode()), Some(counter));
        assert_eq!(Counter::decode(&[1, 2, 3]), None);
    }

    #[tokio::test]
    async fn test_counts_increase_by_one_within_window() {
        let (_dir, limiter) = open_limiter();
        let window = Duration::hours(1);

        for expected in 1..=6u32 {
            let now = start() + Duration::minutes(expected as i64);
            let record = limiter.check_and_increment("10.0.0.1", now, window).await.unwrap();
            assert_eq!(record.count, expected);
            assert_eq!(record.window_start, start() + Duration::minutes(1));
        }
    }

    #[tokio::test]
    async fn test_window_resets_after_expiry() {
        let (_dir, limiter) = open_limiter();
        let window = Duration::hours(1);

        limiter.check_and_increment("10.0.0.1", start(), window).await.unwrap();
        limiter.check_and_increment("10.0.0.1", start(), window).await.unwrap();

        // Exactly one window later still counts toward the old window.
        let edge = limiter
            .check_and_increment("10.0.0.1", start() + window, window)
            .await
            .unwrap();
        assert_eq!(edge.count, 3);

        let later = start() + window + Duration::seconds(1);
        let record = limiter.check_and_increment("10.0.0.1", later, window).await.unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.window_start, later);
    }

    #[tokio::test]
    async fn test_clients_are_independent() {
        let (_dir, limiter) = open_limiter();
        let window = Duration::hours(1);

        limiter.check_and_increment("a", start(), window).await.unwrap();
        limiter.check_and_increment("a", start(), window).await.unwrap();
        let b = limiter.check_and_increment("b", start(), window).await.unwrap();

        assert_eq!(b.count, 1);
        assert_eq!(limiter.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_share_a_count() {
        let (_dir, limiter) = open_limiter();
        let limiter = Arc::new(limiter);
        let window = Duration::hours(1);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .check_and_increment("10.0.0.9", start(), window)
                        .await
                        .unwrap()
                        .count
                })
            })
            .collect();

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=32).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_remaining_window() {
        let (_dir, limiter) = open_limiter();
        let window = Duration::hours(1);
        let record = limiter.check_and_increment("c", start(), window).await.unwrap();

        let now = start() + Duration::minutes(45);
        assert_eq!(record.remaining(now, window), Duration::minutes(15));
        assert_eq!(record.remaining(start() + Duration::hours(2), window), Duration::zero());
    }

    #[tokio::test]
    async fn test_reap_expired_keeps_live_records() {
        let (_dir, limiter) = open_limiter();
        let window = Duration::hours(1);

        limiter.check_and_increment("old", start(), window).await.unwrap();
        limiter
            .check_and_increment("fresh", start() + Duration::minutes(90), window)
            .await
            .unwrap();

        let removed = limiter
            .reap_expired(start() + Duration::minutes(100), window)
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(limiter.get("old").await.unwrap().is_none());
        assert_eq!(limiter.get("fresh").await.unwrap().unwrap().count, 1);
    }
}
