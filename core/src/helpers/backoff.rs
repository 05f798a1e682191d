use rand::Rng;
use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_secs(5);
const MAX_DELAY: Duration = Duration::from_secs(3600);

/// Exponential backoff for retry number `attempt` (1-based), with a
/// 0.85..1.15 jitter factor so coinciding retries spread out.
pub fn exponential_backoff(attempt: u32) -> Duration {
  let exponent = attempt.saturating_sub(1).min(16);
  let raw = BASE_DELAY.as_millis() as u64 * 2u64.pow(exponent);
  let capped = raw.min(MAX_DELAY.as_millis() as u64);
  Duration::from_millis(jitter(capped, 0.85, 1.15))
}

/// Jitter band applied to an upstream-provided retry-after delay. Spread over
/// 1.0..1.4 so a burst of jobs against one throttled host does not reschedule
/// onto the same instant.
pub fn retry_after_jitter(delay: Duration) -> Duration {
  Duration::from_millis(jitter(delay.as_millis() as u64, 1.0, 1.4))
}

fn jitter(millis: u64, low: f64, high: f64) -> u64 {
  let factor = rand::rng().random_range(low..high);
  (millis as f64 * factor) as u64
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_backoff_grows_exponentially() {
    for _ in 0..50 {
      let first = exponential_backoff(1);
      let second = exponential_backoff(2);
      let third = exponential_backoff(3);
      assert!(first >= Duration::from_millis(4250) && first <= Duration::from_millis(5750));
      assert!(second >= Duration::from_millis(8500) && second <= Duration::from_millis(11500));
      assert!(third >= Duration::from_millis(17000) && third <= Duration::from_millis(23000));
    }
  }

  #[test]
  fn test_backoff_is_capped() {
    let delay = exponential_backoff(30);
    assert!(delay <= Duration::from_millis((3600f64 * 1000f64 * 1.15) as u64));
  }

  #[test]
  fn test_retry_after_jitter_band() {
    for _ in 0..50 {
      let delay = retry_after_jitter(Duration::from_secs(60));
      assert!(delay >= Duration::from_secs(60));
      assert!(delay <= Duration::from_millis(84000));
    }
  }
}
