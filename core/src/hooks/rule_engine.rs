use crate::{
  context::ApplicationContext,
  job_handler,
  queue::{
    job::{JobError, QueueName},
    job_queue::descriptor,
    runner::{JobContext, QueueRunnerBuilder},
  },
  sqlite::SqliteConnection,
};
use anyhow::{anyhow, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleEvent {
  BookmarkAdded,
  BookmarkEdited,
  TagsAttached,
}

impl RuleEvent {
  fn type_name(&self) -> &'static str {
    match self {
      RuleEvent::BookmarkAdded => "bookmarkAdded",
      RuleEvent::BookmarkEdited => "bookmarkEdited",
      RuleEvent::TagsAttached => "tagsAttached",
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEngineJobPayload {
  pub bookmark_id: String,
  pub events: Vec<RuleEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
  AttachTag { tag: String },
  AddToList { list_id: String },
}

#[derive(Debug, Clone)]
pub struct Rule {
  pub id: String,
  pub event_type: String,
  pub actions: Vec<RuleAction>,
}

#[derive(Clone)]
pub struct RuleRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

impl RuleRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  pub async fn find_for_user(&self, user_id: &str) -> Result<Vec<Rule>> {
    let user_id = user_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement =
          conn.prepare("SELECT id, event_type, actions FROM rules WHERE user_id = ?1")?;
        let rules = statement
          .query_map(params![user_id], |row| {
            let actions_raw: String = row.get(2)?;
            Ok(Rule {
              id: row.get(0)?,
              event_type: row.get(1)?,
              actions: serde_json::from_str(&actions_raw).unwrap_or_default(),
            })
          })?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rules)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to load rules");
        anyhow!("Failed to load rules")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to load rules");
        anyhow!("Failed to load rules")
      })
  }
}

/// Matches the event list against the user's stored rules and applies the
/// actions of every matching rule.
async fn evaluate_rules(ctx: JobContext) -> Result<(), JobError> {
  let payload: RuleEngineJobPayload = ctx
    .job
    .payload_as()
    .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
  let bookmark = ctx
    .app_context
    .bookmark_repository
    .find(&payload.bookmark_id)
    .await?
    .ok_or_else(|| JobError::fatal("Bookmark no longer exists"))?;

  let rules = ctx
    .app_context
    .rule_repository
    .find_for_user(&bookmark.user_id)
    .await?;
  if rules.is_empty() {
    return Ok(());
  }

  let mut applied = 0usize;
  let mut tags_changed = false;
  for rule in &rules {
    let matched = payload
      .events
      .iter()
      .any(|event| event.type_name() == rule.event_type);
    if !matched {
      continue;
    }
    for action in &rule.actions {
      if ctx.cancellation.is_cancelled() {
        return Err(JobError::Cancelled);
      }
      match action {
        RuleAction::AttachTag { tag } => {
          ctx
            .app_context
            .bookmark_repository
            .attach_tags(&bookmark.id, &bookmark.user_id, vec![tag.clone()], "rule")
            .await?;
          tags_changed = true;
        }
        RuleAction::AddToList { list_id } => {
          ctx
            .app_context
            .bookmark_repository
            .add_to_lists(&bookmark.id, vec![list_id.clone()])
            .await?;
        }
      }
      applied += 1;
    }
  }

  if tags_changed {
    ctx
      .app_context
      .bookmark_interactor
      .enqueue_search_upsert(&bookmark, ctx.job.priority)
      .await
      .map_err(|e| {
        warn!(message = e.to_string(), "Failed to re-index after rule actions");
        e
      })?;
  }
  if applied > 0 {
    info!(
      bookmark_id = bookmark.id.as_str(),
      actions = applied,
      "Rule actions applied"
    );
  }
  Ok(())
}

pub fn setup_rule_engine_jobs(
  app_context: &Arc<ApplicationContext>,
  shutdown: &CancellationToken,
) -> Result<()> {
  Arc::new(
    QueueRunnerBuilder::default()
      .descriptor(descriptor(QueueName::RuleEngine))
      .app_context(Arc::clone(app_context))
      .handler(job_handler!(evaluate_rules))
      .shutdown(shutdown.clone())
      .build()?,
  )
  .run();
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_event_wire_shape() {
    let payload = RuleEngineJobPayload {
      bookmark_id: "b".to_string(),
      events: vec![RuleEvent::BookmarkAdded],
    };
    let encoded = serde_json::to_value(&payload).unwrap();
    assert_eq!(encoded["events"][0]["type"], "bookmarkAdded");
  }

  #[test]
  fn test_action_wire_shape() {
    let actions: Vec<RuleAction> = serde_json::from_str(
      r#"[{"action": "attach_tag", "tag": "news"}, {"action": "add_to_list", "list_id": "l1"}]"#,
    )
    .unwrap();
    assert_eq!(
      actions[0],
      RuleAction::AttachTag {
        tag: "news".to_string()
      }
    );
  }
}
