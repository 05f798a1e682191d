use super::{
  job::{Job, JobError},
  job_queue::QueueDescriptor,
  queue_repository::FailOutcome,
};
use crate::{context::ApplicationContext, metrics::WorkerOutcome};
use anyhow::Result;
use derive_builder::Builder;
use futures::{future::BoxFuture, Future};
use std::{pin::pin, sync::Arc, time::Duration};
use tokio::{spawn, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Grace period an in-flight handler gets after shutdown or timeout before
/// its future is dropped and the job is left to lease-expiry recovery.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct JobContext {
  pub job: Job,
  pub app_context: Arc<ApplicationContext>,
  pub cancellation: CancellationToken,
}

pub type JobHandler = Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// Observer invoked after a failed run; `terminal` is true when no retries
/// remain and the failure is permanent.
pub type ErrorObserver =
  Arc<dyn Fn((Job, String, bool)) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn boxed_handler<Fut>(f: fn(JobContext) -> Fut) -> JobHandler
where
  Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
  Arc::new(move |ctx| Box::pin(f(ctx)))
}

#[macro_export]
macro_rules! job_handler {
  ($f: expr) => {{
    fn f(
      ctx: $crate::queue::runner::JobContext,
    ) -> impl futures::Future<Output = Result<(), $crate::queue::job::JobError>> + Send + 'static
    {
      $f(ctx)
    }
    $crate::queue::runner::boxed_handler(f)
  }};
}

/// Per-queue worker pool bridging the persistent queue and an in-process
/// handler: claim, run inside a cancellable deadline, settle.
#[derive(Builder)]
pub struct QueueRunner {
  pub descriptor: QueueDescriptor,
  pub app_context: Arc<ApplicationContext>,
  pub handler: JobHandler,
  #[builder(default = "1")]
  pub concurrency: u32,
  #[builder(default = "Duration::from_secs(1)")]
  pub poll_interval: Duration,
  #[builder(default = "Duration::from_secs(60)")]
  pub lease: Duration,
  #[builder(default = "self.descriptor_timeout()?")]
  pub timeout: Duration,
  #[builder(default, setter(strip_option))]
  pub on_error: Option<ErrorObserver>,
  pub shutdown: CancellationToken,
}

impl QueueRunnerBuilder {
  fn descriptor_timeout(&self) -> Result<Duration, String> {
    self
      .descriptor
      .map(|d| d.timeout)
      .ok_or_else(|| "Descriptor is required".to_string())
  }
}

impl QueueRunner {
  pub fn run(self: Arc<Self>) {
    for worker in 0..self.concurrency {
      let runner = Arc::clone(&self);
      spawn(async move {
        runner.worker_loop(worker).await;
      });
    }
  }

  async fn worker_loop(&self, worker: u32) {
    let queue = self.descriptor.name;
    info!(queue = queue.to_string(), worker, "Queue worker started");
    loop {
      if self.shutdown.is_cancelled() {
        break;
      }
      let claimed = self
        .app_context
        .queue_repository
        .claim_next(queue, self.lease)
        .await;
      match claimed {
        Ok(Some(job)) => {
          self.process(job).await;
        }
        Ok(None) => {
          tokio::select! {
            _ = sleep(self.poll_interval) => {}
            _ = self.shutdown.cancelled() => break,
          }
        }
        Err(e) => {
          error!(
            queue = queue.to_string(),
            message = e.to_string(),
            "Failed to claim job"
          );
          tokio::select! {
            _ = sleep(self.poll_interval) => {}
            _ = self.shutdown.cancelled() => break,
          }
        }
      }
    }
    info!(queue = queue.to_string(), worker, "Queue worker stopped");
  }

  async fn process(&self, job: Job) {
    let job_cancellation = self.shutdown.child_token();
    let heartbeat = self.spawn_heartbeat(job.id.clone());

    let handler_future = (self.handler)(JobContext {
      job: job.clone(),
      app_context: Arc::clone(&self.app_context),
      cancellation: job_cancellation.clone(),
    });
    let mut handler_future = pin!(handler_future);

    let result = tokio::select! {
      result = &mut handler_future => Some(result),
      _ = sleep(self.timeout) => {
        // Deadline reached: cancel cooperatively, then give the handler the
        // grace period to unwind before dropping it.
        job_cancellation.cancel();
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handler_future).await {
          Ok(result) => Some(result),
          Err(_) => None,
        }
      }
      _ = self.shutdown.cancelled() => {
        job_cancellation.cancel();
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handler_future).await {
          Ok(result) => Some(result),
          Err(_) => None,
        }
      }
    };
    heartbeat.abort();

    match result {
      None => {
        // The handler never settled. Leave the row running; lease expiry
        // returns it to pending.
        warn!(
          job_id = job.id.as_str(),
          queue = job.queue.to_string(),
          "Job abandoned mid-flight, leaving recovery to lease expiry"
        );
      }
      Some(result) => self.settle(job, result).await,
    }
  }

  async fn settle(&self, job: Job, result: Result<(), JobError>) {
    let worker_name = self.descriptor.name.to_string();
    let metrics = &self.app_context.metrics;
    match result {
      Ok(()) => {
        if let Err(e) = self
          .app_context
          .queue_repository
          .complete(&job.id, self.descriptor.retain_completed)
          .await
        {
          error!(
            job_id = job.id.as_str(),
            message = e.to_string(),
            "Failed to complete job"
          );
          return;
        }
        metrics.record_worker_outcome(&worker_name, WorkerOutcome::Completed);
      }
      Err(JobError::RetryAfter(delay)) => {
        info!(
          job_id = job.id.as_str(),
          queue = worker_name.as_str(),
          delay_ms = delay.as_millis() as u64,
          "Job requested delayed retry"
        );
        if let Err(e) = self
          .app_context
          .queue_repository
          .fail(
            &job.id,
            "retry requested",
            Some(delay),
            self.descriptor.keep_failed,
            false,
          )
          .await
        {
          error!(
            job_id = job.id.as_str(),
            message = e.to_string(),
            "Failed to reschedule job"
          );
        }
      }
      Err(JobError::Cancelled) => {
        // The handler observed the shutdown/timeout signal and unwound. The
        // row stays running; lease expiry hands it back without burning the
        // attempt beyond the one already recorded.
        info!(
          job_id = job.id.as_str(),
          queue = worker_name.as_str(),
          "Job cancelled, leaving recovery to lease expiry"
        );
      }
      Err(JobError::InvalidPayload(message)) => {
        // Retrying a malformed payload cannot help; drop it as completed.
        error!(
          job_id = job.id.as_str(),
          queue = worker_name.as_str(),
          message = message.as_str(),
          "Dropping job with invalid payload"
        );
        if let Err(e) = self
          .app_context
          .queue_repository
          .complete(&job.id, self.descriptor.retain_completed)
          .await
        {
          error!(
            job_id = job.id.as_str(),
            message = e.to_string(),
            "Failed to drop job"
          );
        }
        metrics.record_worker_outcome(&worker_name, WorkerOutcome::Completed);
      }
      Err(error) => {
        let force_permanent = matches!(error, JobError::Fatal(_));
        let message = error.to_string();
        let outcome = self
          .app_context
          .queue_repository
          .fail(
            &job.id,
            &message,
            None,
            self.descriptor.keep_failed,
            force_permanent,
          )
          .await;
        match outcome {
          Ok(FailOutcome::Rescheduled) => {
            warn!(
              job_id = job.id.as_str(),
              queue = worker_name.as_str(),
              message = message.as_str(),
              attempt = job.runs_attempted,
              "Job failed, retrying with backoff"
            );
            metrics.record_worker_outcome(&worker_name, WorkerOutcome::Failed);
            self.notify_error(job, message, false).await;
          }
          Ok(FailOutcome::FailedPermanent) => {
            error!(
              job_id = job.id.as_str(),
              queue = worker_name.as_str(),
              message = message.as_str(),
              "Job failed permanently"
            );
            metrics.record_worker_outcome(&worker_name, WorkerOutcome::FailedPermanent);
            self.notify_error(job, message, true).await;
          }
          Err(e) => {
            error!(
              job_id = job.id.as_str(),
              message = e.to_string(),
              "Failed to record job failure"
            );
          }
        }
      }
    }
  }

  async fn notify_error(&self, job: Job, message: String, terminal: bool) {
    if let Some(observer) = &self.on_error {
      if let Err(e) = observer((job, message, terminal)).await {
        error!(message = e.to_string(), "Job error observer failed");
      }
    }
  }

  fn spawn_heartbeat(&self, job_id: String) -> tokio::task::JoinHandle<()> {
    let repository = Arc::clone(&self.app_context.queue_repository);
    let lease = self.lease;
    let interval = lease / 3;
    spawn(async move {
      loop {
        sleep(interval).await;
        if let Err(e) = repository.renew_lease(&job_id, lease).await {
          warn!(
            job_id = job_id.as_str(),
            message = e.to_string(),
            "Failed to renew job lease"
          );
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{
    job::{JobStatus, QueueName},
    job_queue::{descriptor, EnqueueParametersBuilder, JobQueue},
  };
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Debug, Serialize, Deserialize)]
  struct ProbePayload {
    marker: u32,
  }

  static RUNS: AtomicU32 = AtomicU32::new(0);

  async fn succeed(ctx: JobContext) -> Result<(), JobError> {
    let payload: ProbePayload = ctx
      .job
      .payload_as()
      .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
    RUNS.fetch_add(payload.marker, Ordering::SeqCst);
    Ok(())
  }

  static THROTTLED: AtomicU32 = AtomicU32::new(0);

  async fn throttle(_ctx: JobContext) -> Result<(), JobError> {
    THROTTLED.fetch_add(1, Ordering::SeqCst);
    Err(JobError::RetryAfter(Duration::from_secs(120)))
  }

  async fn wait(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
      if predicate() {
        return true;
      }
      sleep(Duration::from_millis(20)).await;
    }
    predicate()
  }

  async fn wait_for_empty_queue<P: Serialize>(queue: &JobQueue<P>) -> Result<bool> {
    for _ in 0..100 {
      if queue.depth().await? == 0 {
        return Ok(true);
      }
      sleep(Duration::from_millis(20)).await;
    }
    Ok(false)
  }

  #[tokio::test]
  async fn test_runner_completes_valid_jobs_and_drops_malformed_ones() -> Result<()> {
    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    let shutdown = CancellationToken::new();
    RUNS.store(0, Ordering::SeqCst);

    let queue = JobQueue::<ProbePayload>::new(
      Arc::clone(&app_context.queue_repository),
      QueueName::Webhook,
    );
    queue
      .enqueue(&ProbePayload { marker: 7 }, Default::default())
      .await?;
    app_context
      .queue_repository
      .enqueue(crate::queue::queue_repository::EnqueueJob {
        queue: QueueName::Webhook,
        payload: b"not json".to_vec(),
        priority: 0,
        group_id: None,
        idempotency_key: None,
        max_retries: 3,
        delay: None,
      })
      .await?;

    Arc::new(
      QueueRunnerBuilder::default()
        .descriptor(descriptor(QueueName::Webhook))
        .app_context(Arc::clone(&app_context))
        .handler(job_handler!(succeed))
        .poll_interval(Duration::from_millis(20))
        .shutdown(shutdown.clone())
        .build()?,
    )
    .run();

    assert!(wait(Duration::from_secs(5), || RUNS.load(Ordering::SeqCst) == 7).await);
    // Both jobs settle: the valid one completes, the malformed one drops.
    assert!(wait_for_empty_queue(&queue).await?);
    shutdown.cancel();
    Ok(())
  }

  #[tokio::test]
  async fn test_runner_routes_retry_after_to_delayed_retry() -> Result<()> {
    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    let shutdown = CancellationToken::new();
    THROTTLED.store(0, Ordering::SeqCst);

    let queue = JobQueue::<ProbePayload>::new(
      Arc::clone(&app_context.queue_repository),
      QueueName::Crawl,
    );
    let job_id = queue
      .enqueue(
        &ProbePayload { marker: 1 },
        EnqueueParametersBuilder::default()
          .group_id("u1")
          .build()?,
      )
      .await?;

    Arc::new(
      QueueRunnerBuilder::default()
        .descriptor(descriptor(QueueName::Crawl))
        .app_context(Arc::clone(&app_context))
        .handler(job_handler!(throttle))
        .poll_interval(Duration::from_millis(20))
        .shutdown(shutdown.clone())
        .build()?,
    )
    .run();

    assert!(wait(Duration::from_secs(5), || THROTTLED.load(Ordering::SeqCst) == 1).await);
    let mut parked = false;
    for _ in 0..100 {
      if let Some(job) = app_context.queue_repository.find_job(&job_id).await? {
        if job.status == JobStatus::Pending && job.runs_attempted == 0 {
          parked = true;
          break;
        }
      }
      sleep(Duration::from_millis(20)).await;
    }
    assert!(parked, "job must be parked as pending with its attempt handed back");
    shutdown.cancel();

    // Parked two minutes out; the runner must not pick it up again.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(THROTTLED.load(Ordering::SeqCst), 1);
    Ok(())
  }
}
