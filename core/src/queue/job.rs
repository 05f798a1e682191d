use anyhow::Result;
use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;

/// User-initiated work.
pub const PRIORITY_USER: u32 = 0;
/// Bulk-import work; always yields to user-initiated jobs.
pub const PRIORITY_BULK: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum QueueName {
  Crawl,
  Tag,
  Summarize,
  SearchIndex,
  AssetPreprocessing,
  Video,
  Webhook,
  RuleEngine,
  AssetDeletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
  Pending,
  Running,
  Failed,
  Completed,
}

#[derive(Debug, Clone)]
pub struct Job {
  pub id: String,
  pub queue: QueueName,
  pub payload: Vec<u8>,
  pub priority: u32,
  pub group_id: Option<String>,
  pub status: JobStatus,
  pub runs_attempted: u32,
  pub max_retries: u32,
  pub next_run_at: NaiveDateTime,
  pub idempotency_key: Option<String>,
  pub lease_expires_at: Option<NaiveDateTime>,
  pub last_error: Option<String>,
  pub enqueued_at: NaiveDateTime,
}

impl Job {
  pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P> {
    Ok(serde_json::from_slice(&self.payload)?)
  }

  pub fn retries_remaining(&self) -> bool {
    self.runs_attempted <= self.max_retries
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
  pub pending: u64,
  pub running: u64,
  pub pending_retry: u64,
  pub failed: u64,
}

/// Terminal channel for job handlers. `RetryAfter` is the throttling
/// sentinel: the runtime reschedules without consuming an attempt.
#[derive(Debug, Error)]
pub enum JobError {
  #[error("retry requested in {0:?}")]
  RetryAfter(Duration),
  #[error("invalid payload: {0}")]
  InvalidPayload(String),
  #[error("cancelled")]
  Cancelled,
  #[error("fatal: {0}")]
  Fatal(#[source] anyhow::Error),
  #[error(transparent)]
  Retryable(#[from] anyhow::Error),
}

impl JobError {
  pub fn fatal(message: impl Into<String>) -> Self {
    JobError::Fatal(anyhow::anyhow!(message.into()))
  }

  pub fn retryable(message: impl Into<String>) -> Self {
    JobError::Retryable(anyhow::anyhow!(message.into()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::str::FromStr;

  #[test]
  fn test_queue_name_round_trips_through_strings() {
    assert_eq!(QueueName::SearchIndex.to_string(), "search_index");
    assert_eq!(
      QueueName::from_str("asset_preprocessing").unwrap(),
      QueueName::AssetPreprocessing
    );
    assert!(QueueName::from_str("nonsense").is_err());
  }

  #[test]
  fn test_job_status_round_trips_through_strings() {
    for status in [
      JobStatus::Pending,
      JobStatus::Running,
      JobStatus::Failed,
      JobStatus::Completed,
    ] {
      assert_eq!(JobStatus::from_str(&status.to_string()).unwrap(), status);
    }
  }
}
