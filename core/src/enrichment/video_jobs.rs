use crate::{
  assets::asset_manager::StagedAsset,
  bookmarks::bookmark::AssetRole,
  context::ApplicationContext,
  job_handler,
  queue::{
    job::{JobError, QueueName},
    job_queue::descriptor,
    runner::{JobContext, QueueRunnerBuilder},
  },
};
use anyhow::{anyhow, Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::{process::Stdio, sync::Arc};
use tokio::{io::AsyncReadExt, process::Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoJobPayload {
  pub bookmark_id: String,
  pub url: String,
}

/// Pulls the page's primary video with yt-dlp, bounded by the asset size
/// cap, and attaches it as a video asset.
async fn extract_video(ctx: JobContext) -> Result<(), JobError> {
  let payload: VideoJobPayload = ctx
    .job
    .payload_as()
    .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
  let bookmark = ctx
    .app_context
    .bookmark_repository
    .find(&payload.bookmark_id)
    .await?
    .ok_or_else(|| JobError::fatal("Bookmark no longer exists"))?;

  let max_size = ctx.app_context.settings.max_asset_size_bytes();
  let mut child = Command::new("yt-dlp")
    .arg("--no-playlist")
    .arg("--max-filesize")
    .arg(format!("{}M", ctx.app_context.settings.max_asset_size_mb))
    .arg("-o")
    .arg("-")
    .arg(&payload.url)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::inherit())
    .kill_on_drop(true)
    .spawn()
    .context("Failed to spawn yt-dlp")
    .map_err(JobError::Retryable)?;

  let mut stdout = child
    .stdout
    .take()
    .ok_or_else(|| JobError::retryable("yt-dlp stdout unavailable"))?;
  let mut video = Vec::new();
  let mut buffer = vec![0u8; 64 * 1024];
  loop {
    let read = tokio::select! {
      read = stdout.read(&mut buffer) => {
        read.map_err(|e| JobError::Retryable(anyhow!("yt-dlp read failed: {}", e)))?
      }
      _ = ctx.cancellation.cancelled() => return Err(JobError::Cancelled),
    };
    if read == 0 {
      break;
    }
    if (video.len() + read) as u64 > max_size {
      warn!(
        bookmark_id = bookmark.id.as_str(),
        "Video exceeds the asset size cap, skipping"
      );
      return Ok(());
    }
    video.extend_from_slice(&buffer[..read]);
  }
  let status = child
    .wait()
    .await
    .map_err(|e| JobError::Retryable(anyhow!("yt-dlp wait failed: {}", e)))?;
  if !status.success() {
    // Most pages simply have no extractable video; that is not a failure
    // worth retrying forever.
    info!(
      bookmark_id = bookmark.id.as_str(),
      status = status.to_string(),
      "yt-dlp found no downloadable video"
    );
    return Ok(());
  }
  if video.is_empty() {
    return Ok(());
  }

  let staged = ctx
    .app_context
    .asset_manager
    .stage(
      &bookmark.user_id,
      AssetRole::Video,
      "video/mp4",
      None,
      Some(payload.url.clone()),
      &video,
    )
    .await?;
  let StagedAsset::Stored(asset) = staged else {
    warn!(
      bookmark_id = bookmark.id.as_str(),
      "Video skipped, storage quota exceeded"
    );
    return Ok(());
  };

  let superseded = ctx
    .app_context
    .bookmark_repository
    .replace_asset(&bookmark.id, asset)
    .await?;
  for old in superseded {
    ctx
      .app_context
      .asset_manager
      .delete(&bookmark.user_id, &old.id, old.size_bytes)
      .await
      .ok();
  }
  info!(
    bookmark_id = bookmark.id.as_str(),
    bytes = video.len(),
    "Video attached"
  );
  Ok(())
}

pub fn setup_video_jobs(
  app_context: &Arc<ApplicationContext>,
  shutdown: &CancellationToken,
) -> Result<()> {
  Arc::new(
    QueueRunnerBuilder::default()
      .descriptor(descriptor(QueueName::Video))
      .app_context(Arc::clone(app_context))
      .handler(job_handler!(extract_video))
      .lease(std::time::Duration::from_secs(120))
      .shutdown(shutdown.clone())
      .build()?,
  )
  .run();
  Ok(())
}
