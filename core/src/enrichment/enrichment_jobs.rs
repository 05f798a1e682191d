use crate::{
  bookmarks::bookmark::{Bookmark, BookmarkKind, EnrichmentStatus},
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
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentKind {
  Tag,
  Summarize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentJobPayload {
  pub bookmark_id: String,
  #[serde(rename = "type")]
  pub kind: EnrichmentKind,
}

fn inference_content(bookmark: &Bookmark) -> Option<String> {
  if let Some(link) = &bookmark.link {
    let mut parts = Vec::new();
    if let Some(description) = &link.description {
      parts.push(description.clone());
    }
    if let Some(content) = &link.html_content {
      parts.push(content.clone());
    }
    if parts.is_empty() {
      return None;
    }
    return Some(parts.join("\n"));
  }
  bookmark.text.as_ref().map(|text| text.text.clone())
}

fn bookmark_title(bookmark: &Bookmark) -> Option<String> {
  bookmark
    .link
    .as_ref()
    .and_then(|link| link.title.clone())
    .or_else(|| {
      bookmark
        .assets
        .first()
        .and_then(|asset| asset.file_name.clone())
    })
}

async fn enrich(ctx: JobContext) -> Result<(), JobError> {
  let payload: EnrichmentJobPayload = ctx
    .job
    .payload_as()
    .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
  let bookmark = ctx
    .app_context
    .bookmark_repository
    .find(&payload.bookmark_id)
    .await?
    .ok_or_else(|| JobError::fatal("Bookmark no longer exists"))?;

  let Some(content) = inference_content(&bookmark) else {
    // Nothing to infer from; close the status out rather than spinning.
    info!(
      bookmark_id = bookmark.id.as_str(),
      "No content for inference, skipping"
    );
    set_status(&ctx, &bookmark, payload.kind, None).await?;
    return Ok(());
  };
  if ctx.cancellation.is_cancelled() {
    return Err(JobError::Cancelled);
  }

  match payload.kind {
    EnrichmentKind::Tag => {
      let existing = ctx
        .app_context
        .bookmark_repository
        .tag_names(&bookmark.id)
        .await?;
      let tags = ctx
        .app_context
        .inference_client
        .suggest_tags(bookmark_title(&bookmark).as_deref(), &content, &existing)
        .await?;
      info!(
        bookmark_id = bookmark.id.as_str(),
        count = tags.len(),
        "Attaching AI tags"
      );
      ctx
        .app_context
        .bookmark_repository
        .attach_tags(&bookmark.id, &bookmark.user_id, tags, "ai")
        .await?;
    }
    EnrichmentKind::Summarize => {
      let summary = ctx
        .app_context
        .inference_client
        .summarize(bookmark_title(&bookmark).as_deref(), &content)
        .await?;
      if bookmark.kind == BookmarkKind::Link {
        ctx
          .app_context
          .bookmark_repository
          .set_summary(&bookmark.id, &summary)
          .await?;
      }
    }
  }

  set_status(&ctx, &bookmark, payload.kind, Some(EnrichmentStatus::Success)).await?;
  // Tags and summaries are searchable; refresh the index entry.
  ctx
    .app_context
    .bookmark_interactor
    .enqueue_search_upsert(&bookmark, ctx.job.priority)
    .await?;
  Ok(())
}

async fn set_status(
  ctx: &JobContext,
  bookmark: &Bookmark,
  kind: EnrichmentKind,
  status: Option<EnrichmentStatus>,
) -> Result<()> {
  match kind {
    EnrichmentKind::Tag => {
      ctx
        .app_context
        .bookmark_repository
        .set_tagging_status(&bookmark.id, status)
        .await
    }
    EnrichmentKind::Summarize => {
      ctx
        .app_context
        .bookmark_repository
        .set_summarization_status(&bookmark.id, status)
        .await
    }
  }
}

fn enrichment_failure_observer(app_context: &Arc<ApplicationContext>) -> ErrorObserver {
  let app_context = Arc::clone(app_context);
  Arc::new(move |(job, _message, terminal): (Job, String, bool)| {
    let app_context = Arc::clone(&app_context);
    let settle: BoxFuture<'static, Result<()>> = Box::pin(async move {
      if !terminal {
        return Ok(());
      }
      let payload: EnrichmentJobPayload = job.payload_as()?;
      match payload.kind {
        EnrichmentKind::Tag => {
          app_context
            .bookmark_repository
            .set_tagging_status(&payload.bookmark_id, Some(EnrichmentStatus::Failure))
            .await
        }
        EnrichmentKind::Summarize => {
          app_context
            .bookmark_repository
            .set_summarization_status(&payload.bookmark_id, Some(EnrichmentStatus::Failure))
            .await
        }
      }
    });
    settle
  })
}

pub fn setup_enrichment_jobs(
  app_context: &Arc<ApplicationContext>,
  shutdown: &CancellationToken,
) -> Result<()> {
  for queue in [QueueName::Tag, QueueName::Summarize] {
    Arc::new(
      QueueRunnerBuilder::default()
        .descriptor(descriptor(queue))
        .app_context(Arc::clone(app_context))
        .handler(job_handler!(enrich))
        .concurrency(2)
        .on_error(enrichment_failure_observer(app_context))
        .shutdown(shutdown.clone())
        .build()?,
    )
    .run();
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_payload_wire_shape() {
    let payload: EnrichmentJobPayload =
      serde_json::from_str(r#"{"bookmark_id": "b", "type": "summarize"}"#).unwrap();
    assert_eq!(payload.kind, EnrichmentKind::Summarize);
    let reencoded = serde_json::to_value(&payload).unwrap();
    assert_eq!(reencoded["type"], "summarize");
  }
}
