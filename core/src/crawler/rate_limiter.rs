use crate::helpers::key_value_store::KeyValueStore;
use anyhow::Result;
use chrono::{TimeDelta, Utc};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RateLimitBucket {
  pub name: String,
  pub max_requests: u32,
  pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
  pub allowed: bool,
  pub reset_in_seconds: Option<u64>,
}

/// Sliding-window limiter over the shared key-value store. The window is an
/// ordered list of request timestamps per `(bucket, key)`; check-and-insert
/// is made atomic against concurrent workers by a process-local mutex, which
/// is sufficient because the store lives in this process.
///
/// Store failures fail open: a missed throttle beats a stalled crawl fleet.
pub struct DomainRateLimiter {
  kv: Arc<KeyValueStore>,
  lock: Mutex<()>,
}

impl DomainRateLimiter {
  pub fn new(kv: Arc<KeyValueStore>) -> Self {
    Self {
      kv,
      lock: Mutex::new(()),
    }
  }

  pub async fn check(&self, bucket: &RateLimitBucket, key: &str) -> RateLimitDecision {
    let _guard = self.lock.lock().await;
    match self.check_inner(bucket, key).await {
      Ok(decision) => decision,
      Err(e) => {
        warn!(
          bucket = bucket.name.as_str(),
          key,
          message = e.to_string(),
          "Rate limit store unavailable, failing open"
        );
        RateLimitDecision {
          allowed: true,
          reset_in_seconds: None,
        }
      }
    }
  }

  async fn check_inner(&self, bucket: &RateLimitBucket, key: &str) -> Result<RateLimitDecision> {
    let store_key = format!("ratelimit:{}:{}", bucket.name, key);
    let now_ms = Utc::now().timestamp_millis();
    let window_ms = bucket.window.as_millis() as i64;

    let mut stamps: Vec<i64> = self.kv.get(&store_key).await?.unwrap_or_default();
    stamps.retain(|stamp| *stamp > now_ms - window_ms);

    if (stamps.len() as u32) < bucket.max_requests {
      stamps.push(now_ms);
      self
        .kv
        .set(
          &store_key,
          &stamps,
          Some(TimeDelta::milliseconds(window_ms)),
        )
        .await?;
      return Ok(RateLimitDecision {
        allowed: true,
        reset_in_seconds: None,
      });
    }

    let oldest = stamps.iter().min().copied().unwrap_or(now_ms);
    let reset_ms = (oldest + window_ms - now_ms).max(0) as u64;
    Ok(RateLimitDecision {
      allowed: false,
      reset_in_seconds: Some(reset_ms.div_ceil(1000)),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::helpers::test::test_sqlite_connection;

  async fn test_limiter() -> Result<(DomainRateLimiter, tempfile::TempDir)> {
    let (connection, dir) = test_sqlite_connection().await?;
    Ok((
      DomainRateLimiter::new(Arc::new(KeyValueStore::new(Arc::new(connection)))),
      dir,
    ))
  }

  fn bucket(max_requests: u32, window: Duration) -> RateLimitBucket {
    RateLimitBucket {
      name: "crawler".to_string(),
      max_requests,
      window,
    }
  }

  #[tokio::test]
  async fn test_denies_once_window_is_full() -> Result<()> {
    let (limiter, _dir) = test_limiter().await?;
    let bucket = bucket(2, Duration::from_secs(60));

    assert!(limiter.check(&bucket, "slow.example").await.allowed);
    assert!(limiter.check(&bucket, "slow.example").await.allowed);

    let denied = limiter.check(&bucket, "slow.example").await;
    assert!(!denied.allowed);
    let reset = denied.reset_in_seconds.unwrap();
    assert!(reset >= 1 && reset <= 60, "reset_in_seconds = {}", reset);
    Ok(())
  }

  #[tokio::test]
  async fn test_keys_are_tracked_independently() -> Result<()> {
    let (limiter, _dir) = test_limiter().await?;
    let bucket = bucket(1, Duration::from_secs(60));

    assert!(limiter.check(&bucket, "a.example").await.allowed);
    assert!(limiter.check(&bucket, "b.example").await.allowed);
    assert!(!limiter.check(&bucket, "a.example").await.allowed);
    Ok(())
  }

  #[tokio::test]
  async fn test_window_slides() -> Result<()> {
    let (limiter, _dir) = test_limiter().await?;
    let bucket = bucket(1, Duration::from_millis(150));

    assert!(limiter.check(&bucket, "host").await.allowed);
    assert!(!limiter.check(&bucket, "host").await.allowed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(limiter.check(&bucket, "host").await.allowed);
    Ok(())
  }
}
