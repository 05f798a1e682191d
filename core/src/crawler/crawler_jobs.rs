use crate::{
  context::ApplicationContext,
  job_handler,
  queue::{
    job::{Job, JobError, QueueName},
    job_queue::descriptor,
    runner::{ErrorObserver, JobContext, QueueRunnerBuilder},
  },
};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJobPayload {
  pub bookmark_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub archive_full_page: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub store_pdf: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub run_inference: Option<bool>,
}

async fn crawl(ctx: JobContext) -> Result<(), JobError> {
  let payload: CrawlJobPayload = ctx
    .job
    .payload_as()
    .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
  ctx
    .app_context
    .crawler
    .crawl(payload, &ctx.job, &ctx.cancellation)
    .await
}

/// A permanently failed crawl surfaces on the bookmark row.
fn crawl_failure_observer(app_context: &Arc<ApplicationContext>) -> ErrorObserver {
  let app_context = Arc::clone(app_context);
  Arc::new(move |(job, _message, terminal): (Job, String, bool)| {
    let app_context = Arc::clone(&app_context);
    let settle: BoxFuture<'static, Result<()>> = Box::pin(async move {
      if !terminal {
        return Ok(());
      }
      let payload: CrawlJobPayload = job.payload_as()?;
      app_context
        .bookmark_repository
        .mark_crawl_failure(&payload.bookmark_id, None)
        .await
    });
    settle
  })
}

pub fn setup_crawler_jobs(
  app_context: &Arc<ApplicationContext>,
  shutdown: &CancellationToken,
) -> Result<()> {
  let crawler_settings = &app_context.settings.crawler;
  let job_timeout = Duration::from_secs(crawler_settings.job_timeout_seconds);
  Arc::new(
    QueueRunnerBuilder::default()
      .descriptor(descriptor(QueueName::Crawl))
      .app_context(Arc::clone(app_context))
      .handler(job_handler!(crawl))
      .concurrency(crawler_settings.num_workers)
      .timeout(job_timeout)
      // The lease outlives the deadline so a live handler is never poached.
      .lease(job_timeout + Duration::from_secs(30))
      .on_error(crawl_failure_observer(app_context))
      .shutdown(shutdown.clone())
      .build()?,
  )
  .run();
  Ok(())
}
