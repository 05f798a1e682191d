use crate::{
  assets::asset_manager::content_hash,
  context::ApplicationContext,
  job_handler,
  queue::{
    job::{JobError, QueueName},
    job_queue::descriptor,
    runner::{JobContext, QueueRunnerBuilder},
  },
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetPreprocessingJobPayload {
  pub bookmark_id: String,
  pub fix_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetDeletionJobPayload {
  pub user_id: String,
  pub asset_id: String,
  pub size_bytes: u64,
}

/// Backfills blob integrity metadata for an uploaded or morphed asset, then
/// kicks off the same enrichment fan-out a crawled link gets.
async fn preprocess_asset(ctx: JobContext) -> Result<(), JobError> {
  let payload: AssetPreprocessingJobPayload = ctx
    .job
    .payload_as()
    .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
  let bookmark = ctx
    .app_context
    .bookmark_repository
    .find(&payload.bookmark_id)
    .await?
    .ok_or_else(|| JobError::fatal("Bookmark no longer exists"))?;

  let assets = if payload.fix_mode {
    bookmark.assets.clone()
  } else {
    bookmark
      .asset_with_role(crate::bookmarks::bookmark::AssetRole::Primary)
      .cloned()
      .into_iter()
      .collect()
  };

  for asset in assets {
    if ctx.cancellation.is_cancelled() {
      return Err(JobError::Cancelled);
    }
    let bytes = ctx
      .app_context
      .asset_manager
      .fetch(&bookmark.user_id, &asset.id)
      .await?;
    let hash = content_hash(&bytes);
    match &asset.content_hash {
      Some(existing) if *existing != hash => {
        warn!(
          asset_id = asset.id.as_str(),
          "Stored asset hash does not match blob contents"
        );
      }
      Some(_) => {}
      None => {
        ctx
          .app_context
          .bookmark_repository
          .update_asset_hash(&asset.id, &hash, bytes.len() as u64)
          .await?;
      }
    }
  }

  if !payload.fix_mode {
    ctx
      .app_context
      .bookmark_interactor
      .request_enrichment(&bookmark, ctx.job.priority)
      .await?;
    ctx
      .app_context
      .bookmark_interactor
      .enqueue_search_upsert(&bookmark, ctx.job.priority)
      .await?;
  }
  info!(bookmark_id = bookmark.id.as_str(), "Asset preprocessing finished");
  Ok(())
}

/// Superseded blobs are removed outside the transaction that replaced them.
async fn delete_asset(ctx: JobContext) -> Result<(), JobError> {
  let payload: AssetDeletionJobPayload = ctx
    .job
    .payload_as()
    .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
  ctx
    .app_context
    .asset_manager
    .delete(&payload.user_id, &payload.asset_id, payload.size_bytes)
    .await?;
  Ok(())
}

pub fn setup_asset_jobs(
  app_context: &Arc<ApplicationContext>,
  shutdown: &CancellationToken,
) -> Result<()> {
  Arc::new(
    QueueRunnerBuilder::default()
      .descriptor(descriptor(QueueName::AssetPreprocessing))
      .app_context(Arc::clone(app_context))
      .handler(job_handler!(preprocess_asset))
      .concurrency(2)
      .shutdown(shutdown.clone())
      .build()?,
  )
  .run();

  Arc::new(
    QueueRunnerBuilder::default()
      .descriptor(descriptor(QueueName::AssetDeletion))
      .app_context(Arc::clone(app_context))
      .handler(job_handler!(delete_asset))
      .shutdown(shutdown.clone())
      .build()?,
  )
  .run();
  Ok(())
}
