use super::batch_writer::IndexOp;
use crate::{
  bookmarks::bookmark::Bookmark,
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
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOperation {
  Upsert,
  Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchIndexJobPayload {
  pub bookmark_id: String,
  #[serde(rename = "type")]
  pub operation: SearchOperation,
}

fn to_document(bookmark: &Bookmark, tags: Vec<String>) -> serde_json::Value {
  let mut doc = json!({
    "user_id": bookmark.user_id,
    "kind": bookmark.kind.to_string(),
    "tags": tags,
    "created_at": bookmark.created_at.and_utc().timestamp(),
  });
  if let Some(link) = &bookmark.link {
    doc["url"] = json!(link.url);
    doc["title"] = json!(link.title);
    doc["description"] = json!(link.description);
    doc["content"] = json!(link.html_content);
    doc["author"] = json!(link.author);
    doc["publisher"] = json!(link.publisher);
  }
  if let Some(text) = &bookmark.text {
    doc["content"] = json!(text.text);
    doc["url"] = json!(text.source_url);
  }
  if let Some(asset) = bookmark.assets.first() {
    doc["file_name"] = json!(asset.file_name);
  }
  doc
}

async fn index_bookmark(ctx: JobContext) -> Result<(), JobError> {
  let payload: SearchIndexJobPayload = ctx
    .job
    .payload_as()
    .map_err(|e| JobError::InvalidPayload(e.to_string()))?;

  match payload.operation {
    SearchOperation::Delete => {
      ctx
        .app_context
        .index_writer
        .submit(IndexOp::Delete {
          id: payload.bookmark_id,
        })
        .await?;
    }
    SearchOperation::Upsert => {
      let Some(bookmark) = ctx
        .app_context
        .bookmark_repository
        .find(&payload.bookmark_id)
        .await?
      else {
        // Deleted while queued; drop the stale document instead.
        info!(
          bookmark_id = payload.bookmark_id.as_str(),
          "Bookmark gone, deleting index entry"
        );
        ctx
          .app_context
          .index_writer
          .submit(IndexOp::Delete {
            id: payload.bookmark_id,
          })
          .await?;
        return Ok(());
      };
      let tags = ctx
        .app_context
        .bookmark_repository
        .tag_names(&bookmark.id)
        .await?;
      ctx
        .app_context
        .index_writer
        .submit(IndexOp::Upsert {
          id: bookmark.id.clone(),
          doc: to_document(&bookmark, tags),
        })
        .await?;
    }
  }
  Ok(())
}

pub fn setup_search_jobs(
  app_context: &Arc<ApplicationContext>,
  shutdown: &CancellationToken,
) -> Result<()> {
  Arc::new(
    QueueRunnerBuilder::default()
      .descriptor(descriptor(QueueName::SearchIndex))
      .app_context(Arc::clone(app_context))
      .handler(job_handler!(index_bookmark))
      // Several workers feed the batching writer so bulk windows fill up.
      .concurrency(4)
      .shutdown(shutdown.clone())
      .build()?,
  )
  .run();
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bookmarks::bookmark::{BookmarkKind, LinkDetails};
  use chrono::Utc;

  #[test]
  fn test_document_projection_for_links() {
    let bookmark = Bookmark {
      id: "bm1".to_string(),
      user_id: "u1".to_string(),
      kind: BookmarkKind::Link,
      created_at: Utc::now().naive_utc(),
      modified_at: None,
      link: Some(LinkDetails {
        url: "https://example.com".to_string(),
        title: Some("Example".to_string()),
        html_content: Some("<p>body</p>".to_string()),
        ..Default::default()
      }),
      text: None,
      assets: vec![],
    };
    let doc = to_document(&bookmark, vec!["rust".to_string()]);
    assert_eq!(doc["user_id"], "u1");
    assert_eq!(doc["title"], "Example");
    assert_eq!(doc["content"], "<p>body</p>");
    assert_eq!(doc["tags"][0], "rust");
  }

  #[test]
  fn test_payload_wire_shape() {
    let payload: SearchIndexJobPayload =
      serde_json::from_str(r#"{"bookmark_id": "b", "type": "delete"}"#).unwrap();
    assert_eq!(payload.operation, SearchOperation::Delete);
  }
}
