use super::job::{Job, JobStatus, QueueName, QueueStats};
use crate::{helpers::backoff::exponential_backoff, sqlite::SqliteConnection};
use anyhow::{anyhow, Result};
use chrono::{TimeDelta, Utc};
use rusqlite::{params, OptionalExtension};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::error;
use ulid::Ulid;

const JOB_COLUMNS: &str = "
  j.id, j.queue, j.payload, j.priority, j.group_id, j.status, j.runs_attempted,
  j.max_retries, j.next_run_at, j.idempotency_key, j.lease_expires_at,
  j.last_error, j.enqueued_at
";

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
  Ok(Job {
    id: row.get(0)?,
    queue: QueueName::from_str(row.get::<_, String>(1)?.as_str()).unwrap(),
    payload: row.get(2)?,
    priority: row.get(3)?,
    group_id: row.get(4)?,
    status: JobStatus::from_str(row.get::<_, String>(5)?.as_str()).unwrap(),
    runs_attempted: row.get(6)?,
    max_retries: row.get(7)?,
    next_run_at: row.get(8)?,
    idempotency_key: row.get(9)?,
    lease_expires_at: row.get(10)?,
    last_error: row.get(11)?,
    enqueued_at: row.get(12)?,
  })
}

#[derive(Debug, Clone)]
pub struct EnqueueJob {
  pub queue: QueueName,
  pub payload: Vec<u8>,
  pub priority: u32,
  pub group_id: Option<String>,
  pub idempotency_key: Option<String>,
  pub max_retries: u32,
  pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
  Rescheduled,
  FailedPermanent,
}

#[derive(Clone)]
pub struct QueueRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

impl QueueRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  /// Inserts a pending job. An idempotency key that collides with an open
  /// job on the same queue collapses to the existing job id.
  pub async fn enqueue(&self, record: EnqueueJob) -> Result<String> {
    let now = Utc::now().naive_utc();
    let next_run_at = match record.delay {
      Some(delay) => now + TimeDelta::from_std(delay)?,
      None => now,
    };
    let id = Ulid::new().to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        if let Some(key) = &record.idempotency_key {
          let existing: Option<String> = tx
            .query_row(
              "SELECT id FROM queue_jobs
               WHERE queue = ?1 AND idempotency_key = ?2 AND status IN ('pending', 'running')",
              params![record.queue.to_string(), key],
              |row| row.get(0),
            )
            .optional()?;
          if let Some(existing_id) = existing {
            tx.commit()?;
            return Ok(existing_id);
          }
        }
        tx.execute(
          "INSERT INTO queue_jobs
             (id, queue, payload, priority, group_id, status, runs_attempted,
              max_retries, next_run_at, idempotency_key, enqueued_at)
           VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?8, ?9)",
          params![
            id,
            record.queue.to_string(),
            record.payload,
            record.priority,
            record.group_id,
            record.max_retries,
            next_run_at,
            record.idempotency_key,
            now,
          ],
        )?;
        tx.commit()?;
        Ok::<_, rusqlite::Error>(id)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to enqueue job");
        anyhow!("Failed to enqueue job")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to enqueue job");
        anyhow!("Failed to enqueue job")
      })
  }

  /// Claims the next dispatchable job in a single transaction: highest
  /// priority first, then the least-recently-served group, then FIFO. The
  /// group cursor is bumped in the same transaction so concurrent workers
  /// rotate fairly across groups.
  pub async fn claim_next(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>> {
    let now = Utc::now().naive_utc();
    let lease_expires_at = now + TimeDelta::from_std(lease)?;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        let job = tx
          .query_row(
            &format!(
              "SELECT {JOB_COLUMNS} FROM queue_jobs j
               LEFT JOIN queue_group_cursor g
                 ON g.queue = j.queue AND g.group_id = j.group_id
               WHERE j.queue = ?1 AND j.status = 'pending' AND j.next_run_at <= ?2
               ORDER BY j.priority ASC, g.last_served_at ASC, j.enqueued_at ASC
               LIMIT 1"
            ),
            params![queue.to_string(), now],
            row_to_job,
          )
          .optional()?;

        let Some(mut job) = job else {
          return Ok(None);
        };

        tx.execute(
          "UPDATE queue_jobs
           SET status = 'running', runs_attempted = runs_attempted + 1, lease_expires_at = ?2
           WHERE id = ?1",
          params![job.id, lease_expires_at],
        )?;
        if let Some(group_id) = &job.group_id {
          tx.execute(
            "INSERT INTO queue_group_cursor (queue, group_id, last_served_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (queue, group_id) DO UPDATE SET last_served_at = excluded.last_served_at",
            params![queue.to_string(), group_id, now],
          )?;
        }
        tx.commit()?;

        job.status = JobStatus::Running;
        job.runs_attempted += 1;
        job.lease_expires_at = Some(lease_expires_at);
        Ok::<_, rusqlite::Error>(Some(job))
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to claim job");
        anyhow!("Failed to claim job")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to claim job");
        anyhow!("Failed to claim job")
      })
  }

  pub async fn complete(&self, job_id: &str, retain: bool) -> Result<()> {
    let job_id = job_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        if retain {
          conn.execute(
            "UPDATE queue_jobs
             SET status = 'completed', lease_expires_at = NULL, completed_at = ?2
             WHERE id = ?1",
            params![job_id, Utc::now().naive_utc()],
          )?;
        } else {
          conn.execute("DELETE FROM queue_jobs WHERE id = ?1", params![job_id])?;
        }
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to complete job");
        anyhow!("Failed to complete job")
      })?
  }

  /// Records a failed run. A `retry_after` delay is the throttling path: the
  /// job goes back to pending at the requested instant and the attempt is
  /// handed back. Otherwise remaining attempts reschedule with exponential
  /// backoff and exhausted ones go terminal.
  pub async fn fail(
    &self,
    job_id: &str,
    error_message: &str,
    retry_after: Option<Duration>,
    keep_failed: bool,
    force_permanent: bool,
  ) -> Result<FailOutcome> {
    let job_id = job_id.to_string();
    let error_message = error_message.to_string();
    let now = Utc::now().naive_utc();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        let row: Option<(u32, u32)> = tx
          .query_row(
            "SELECT runs_attempted, max_retries FROM queue_jobs WHERE id = ?1",
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()?;
        let Some((runs_attempted, max_retries)) = row else {
          tx.commit()?;
          return Ok(FailOutcome::FailedPermanent);
        };

        let outcome = if let (Some(delay), false) = (retry_after, force_permanent) {
          let next_run_at = now + TimeDelta::from_std(delay).unwrap_or_default();
          tx.execute(
            "UPDATE queue_jobs
             SET status = 'pending', runs_attempted = ?2, next_run_at = ?3,
                 lease_expires_at = NULL, last_error = ?4
             WHERE id = ?1",
            params![job_id, runs_attempted.saturating_sub(1), next_run_at, error_message],
          )?;
          FailOutcome::Rescheduled
        } else if !force_permanent && runs_attempted <= max_retries {
          let next_run_at = now
            + TimeDelta::from_std(exponential_backoff(runs_attempted)).unwrap_or_default();
          tx.execute(
            "UPDATE queue_jobs
             SET status = 'pending', next_run_at = ?2, lease_expires_at = NULL, last_error = ?3
             WHERE id = ?1",
            params![job_id, next_run_at, error_message],
          )?;
          FailOutcome::Rescheduled
        } else {
          if keep_failed {
            tx.execute(
              "UPDATE queue_jobs
               SET status = 'failed', lease_expires_at = NULL, last_error = ?2, completed_at = ?3
               WHERE id = ?1",
              params![job_id, error_message, now],
            )?;
          } else {
            tx.execute("DELETE FROM queue_jobs WHERE id = ?1", params![job_id])?;
          }
          FailOutcome::FailedPermanent
        };
        tx.commit()?;
        Ok::<_, rusqlite::Error>(outcome)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to record job failure");
        anyhow!("Failed to record job failure")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to record job failure");
        anyhow!("Failed to record job failure")
      })
  }

  pub async fn renew_lease(&self, job_id: &str, lease: Duration) -> Result<()> {
    let job_id = job_id.to_string();
    let lease_expires_at = Utc::now().naive_utc() + TimeDelta::from_std(lease)?;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE queue_jobs SET lease_expires_at = ?2 WHERE id = ?1 AND status = 'running'",
          params![job_id, lease_expires_at],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to renew lease");
        anyhow!("Failed to renew lease")
      })?
  }

  /// Crash recovery: running jobs whose lease expired go back to pending.
  pub async fn recover_expired_leases(&self) -> Result<usize> {
    let now = Utc::now().naive_utc();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let recovered = conn.execute(
          "UPDATE queue_jobs
           SET status = 'pending', lease_expires_at = NULL
           WHERE status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?1",
          params![now],
        )?;
        Ok(recovered)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to recover expired leases");
        anyhow!("Failed to recover expired leases")
      })?
  }

  pub async fn stats(&self, queue: QueueName) -> Result<QueueStats> {
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn.query_row(
          "SELECT
             COALESCE(SUM(CASE WHEN status = 'pending' AND runs_attempted = 0 THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN status = 'pending' AND runs_attempted > 0 THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
           FROM queue_jobs WHERE queue = ?1",
          params![queue.to_string()],
          |row| {
            Ok(QueueStats {
              pending: row.get(0)?,
              running: row.get(1)?,
              pending_retry: row.get(2)?,
              failed: row.get(3)?,
            })
          },
        )
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get queue stats");
        anyhow!("Failed to get queue stats")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get queue stats");
        anyhow!("Failed to get queue stats")
      })
  }

  /// Open jobs (pending + running); the import controller reads this as
  /// downstream queue depth.
  pub async fn depth(&self, queue: QueueName) -> Result<u64> {
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn.query_row(
          "SELECT COUNT(*) FROM queue_jobs WHERE queue = ?1 AND status IN ('pending', 'running')",
          params![queue.to_string()],
          |row| row.get(0),
        )
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get queue depth");
        anyhow!("Failed to get queue depth")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get queue depth");
        anyhow!("Failed to get queue depth")
      })
  }

  pub async fn cancel_all_non_running(&self, queue: QueueName) -> Result<usize> {
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let cancelled = conn.execute(
          "DELETE FROM queue_jobs WHERE queue = ?1 AND status != 'running'",
          params![queue.to_string()],
        )?;
        Ok(cancelled)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to cancel jobs");
        anyhow!("Failed to cancel jobs")
      })?
  }

  pub async fn find_job(&self, job_id: &str) -> Result<Option<Job>> {
    let job_id = job_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn
          .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM queue_jobs j WHERE j.id = ?1"),
            params![job_id],
            row_to_job,
          )
          .optional()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to find job");
        anyhow!("Failed to find job")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to find job");
        anyhow!("Failed to find job")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::helpers::test::test_sqlite_connection;

  fn enqueue_record(queue: QueueName) -> EnqueueJob {
    EnqueueJob {
      queue,
      payload: b"{}".to_vec(),
      priority: 0,
      group_id: None,
      idempotency_key: None,
      max_retries: 2,
      delay: None,
    }
  }

  async fn test_repository() -> Result<(QueueRepository, tempfile::TempDir)> {
    let (connection, dir) = test_sqlite_connection().await?;
    Ok((QueueRepository::new(Arc::new(connection)), dir))
  }

  #[tokio::test]
  async fn test_claim_marks_running_and_bumps_attempts() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let id = repository.enqueue(enqueue_record(QueueName::Crawl)).await?;

    let claimed = repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.runs_attempted, 1);
    assert!(claimed.lease_expires_at.is_some());

    // Exactly one worker may hold a running job.
    assert!(repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .is_none());
    Ok(())
  }

  #[tokio::test]
  async fn test_priority_order_is_strict() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let mut bulk = enqueue_record(QueueName::Crawl);
    bulk.priority = 50;
    repository.enqueue(bulk).await?;
    let user = repository.enqueue(enqueue_record(QueueName::Crawl)).await?;

    let claimed = repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();
    assert_eq!(claimed.id, user);
    assert_eq!(claimed.priority, 0);
    Ok(())
  }

  #[tokio::test]
  async fn test_groups_are_served_round_robin() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    for _ in 0..10 {
      for user in ["u1", "u2"] {
        let mut record = enqueue_record(QueueName::Crawl);
        record.priority = 50;
        record.group_id = Some(user.to_string());
        repository.enqueue(record).await?;
      }
    }

    let mut sequence = Vec::new();
    while let Some(job) = repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
    {
      sequence.push(job.group_id.clone().unwrap());
      repository.complete(&job.id, false).await?;
    }

    assert_eq!(sequence.len(), 20);
    // No group is served twice in a row once both have pending work.
    for window in sequence.windows(2) {
      assert_ne!(window[0], window[1], "dispatch sequence: {:?}", sequence);
    }
    Ok(())
  }

  #[tokio::test]
  async fn test_idempotency_key_collapses_open_jobs() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let mut record = enqueue_record(QueueName::Crawl);
    record.idempotency_key = Some("crawl:bm1".to_string());

    let first = repository.enqueue(record.clone()).await?;
    for _ in 0..4 {
      assert_eq!(repository.enqueue(record.clone()).await?, first);
    }
    assert_eq!(
      repository.stats(QueueName::Crawl).await?.pending,
      1,
      "duplicates must collapse"
    );

    // A closed job no longer blocks the key.
    let job = repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();
    repository.complete(&job.id, false).await?;
    let reopened = repository.enqueue(record).await?;
    assert_ne!(reopened, first);
    Ok(())
  }

  #[tokio::test]
  async fn test_delayed_jobs_are_not_dispatchable() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let mut record = enqueue_record(QueueName::Crawl);
    record.delay = Some(Duration::from_secs(3600));
    repository.enqueue(record).await?;

    assert!(repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .is_none());
    Ok(())
  }

  #[tokio::test]
  async fn test_retry_after_hands_back_the_attempt() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let id = repository.enqueue(enqueue_record(QueueName::Crawl)).await?;
    let job = repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();
    assert_eq!(job.runs_attempted, 1);

    let outcome = repository
      .fail(&job.id, "rate limited", Some(Duration::from_secs(60)), true, false)
      .await?;
    assert_eq!(outcome, FailOutcome::Rescheduled);

    let stored = repository.find_job(&id).await?.unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.runs_attempted, 0, "throttling must not consume an attempt");
    assert!(stored.next_run_at > Utc::now().naive_utc() + TimeDelta::seconds(30));
    Ok(())
  }

  #[tokio::test]
  async fn test_retries_exhaust_into_failed() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let mut record = enqueue_record(QueueName::Crawl);
    record.max_retries = 1;
    let id = repository.enqueue(record).await?;

    for expected in [FailOutcome::Rescheduled, FailOutcome::FailedPermanent] {
      // Collapse the backoff window so the job is immediately claimable again.
      repository
        .sqlite_connection
        .write()
        .await?
        .interact(|conn| {
          conn.execute(
            "UPDATE queue_jobs SET next_run_at = datetime('now', '-1 minute') WHERE status = 'pending'",
            [],
          )
        })
        .await
        .unwrap()?;
      let job = repository
        .claim_next(QueueName::Crawl, Duration::from_secs(60))
        .await?
        .unwrap();
      let outcome = repository.fail(&job.id, "boom", None, true, false).await?;
      assert_eq!(outcome, expected);
    }

    let stored = repository.find_job(&id).await?.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.runs_attempted, 2);
    assert_eq!(stored.last_error.as_deref(), Some("boom"));
    Ok(())
  }

  #[tokio::test]
  async fn test_failed_jobs_are_dropped_without_retention() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let mut record = enqueue_record(QueueName::Webhook);
    record.max_retries = 0;
    let id = repository.enqueue(record).await?;
    let job = repository
      .claim_next(QueueName::Webhook, Duration::from_secs(60))
      .await?
      .unwrap();
    repository.fail(&job.id, "gone", None, false, false).await?;
    assert!(repository.find_job(&id).await?.is_none());
    Ok(())
  }

  #[tokio::test]
  async fn test_force_permanent_ignores_remaining_retries() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let id = repository.enqueue(enqueue_record(QueueName::Crawl)).await?;
    let job = repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();
    let outcome = repository
      .fail(&job.id, "blocked by policy", None, true, true)
      .await?;
    assert_eq!(outcome, FailOutcome::FailedPermanent);
    assert_eq!(
      repository.find_job(&id).await?.unwrap().status,
      JobStatus::Failed
    );
    Ok(())
  }

  #[tokio::test]
  async fn test_expired_leases_are_recovered() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let id = repository.enqueue(enqueue_record(QueueName::Crawl)).await?;
    repository
      .claim_next(QueueName::Crawl, Duration::from_secs(0))
      .await?
      .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(repository.recover_expired_leases().await?, 1);

    let recovered = repository.find_job(&id).await?.unwrap();
    assert_eq!(recovered.status, JobStatus::Pending);

    // The recovered job is dispatchable again and keeps its attempt count.
    let reclaimed = repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.runs_attempted, 2);
    Ok(())
  }

  #[tokio::test]
  async fn test_live_leases_are_untouched() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    repository.enqueue(enqueue_record(QueueName::Crawl)).await?;
    let job = repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();
    repository.renew_lease(&job.id, Duration::from_secs(60)).await?;
    assert_eq!(repository.recover_expired_leases().await?, 0);
    Ok(())
  }

  #[tokio::test]
  async fn test_cancel_spares_running_jobs() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    for _ in 0..3 {
      repository.enqueue(enqueue_record(QueueName::Crawl)).await?;
    }
    let running = repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();

    assert_eq!(repository.cancel_all_non_running(QueueName::Crawl).await?, 2);
    assert!(repository.find_job(&running.id).await?.is_some());
    Ok(())
  }

  #[tokio::test]
  async fn test_stats_bucket_by_status() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    for _ in 0..3 {
      repository.enqueue(enqueue_record(QueueName::Crawl)).await?;
    }
    let job = repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();
    repository
      .fail(&job.id, "try later", Some(Duration::from_secs(60)), true, false)
      .await?;
    repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();

    let stats = repository.stats(QueueName::Crawl).await?;
    // The handed-back attempt reads as never-run, so it counts as pending.
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.pending_retry, 0);
    assert_eq!(stats.failed, 0);

    assert_eq!(repository.depth(QueueName::Crawl).await?, 3);
    Ok(())
  }
}
