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
use std::{str::FromStr, sync::Arc, time::Duration};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const WEBHOOK_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
  Created,
  Edited,
  Crawled,
  Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJobPayload {
  pub bookmark_id: String,
  pub event: WebhookEvent,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookEndpoint {
  pub id: String,
  pub url: String,
  pub events: Vec<WebhookEvent>,
}

#[derive(Clone)]
pub struct WebhookRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

impl WebhookRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  pub async fn find_for_event(
    &self,
    user_id: &str,
    event: WebhookEvent,
  ) -> Result<Vec<WebhookEndpoint>> {
    let user_id = user_id.to_string();
    let endpoints = self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement =
          conn.prepare("SELECT id, url, events FROM webhooks WHERE user_id = ?1")?;
        let endpoints = statement
          .query_map(params![user_id], |row| {
            let events_raw: String = row.get(2)?;
            Ok(WebhookEndpoint {
              id: row.get(0)?,
              url: row.get(1)?,
              events: serde_json::from_str::<Vec<String>>(&events_raw)
                .unwrap_or_default()
                .iter()
                .filter_map(|event| WebhookEvent::from_str(event).ok())
                .collect(),
            })
          })?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(endpoints)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to load webhooks");
        anyhow!("Failed to load webhooks")
      })??;
    Ok(
      endpoints
        .into_iter()
        .filter(|endpoint| endpoint.events.contains(&event))
        .collect(),
    )
  }
}

/// Delivers one event to every subscribed endpoint. Any failed delivery
/// fails the job so the queue's retry policy covers all endpoints again;
/// receivers are expected to deduplicate on (bookmark_id, event).
#[instrument(skip(ctx), fields(job_id = ctx.job.id.as_str()))]
async fn deliver_webhook(ctx: JobContext) -> Result<(), JobError> {
  let payload: WebhookJobPayload = ctx
    .job
    .payload_as()
    .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
  let Some(user_id) = payload.user_id.clone() else {
    info!("Webhook event without a user, nothing to deliver");
    return Ok(());
  };
  let endpoints = ctx
    .app_context
    .webhook_repository
    .find_for_event(&user_id, payload.event)
    .await?;
  if endpoints.is_empty() {
    return Ok(());
  }

  let body = serde_json::json!({
    "bookmark_id": payload.bookmark_id,
    "event": payload.event.to_string(),
    "user_id": user_id,
  });
  let mut failures = 0usize;
  for endpoint in &endpoints {
    if ctx.cancellation.is_cancelled() {
      return Err(JobError::Cancelled);
    }
    let delivery = ctx
      .app_context
      .http_client
      .post(&endpoint.url)
      .timeout(WEBHOOK_CALL_TIMEOUT)
      .json(&body)
      .send()
      .await;
    match delivery {
      Ok(response) if response.status().is_success() => {}
      Ok(response) => {
        warn!(
          url = endpoint.url.as_str(),
          status = response.status().as_u16(),
          "Webhook endpoint rejected the event"
        );
        failures += 1;
      }
      Err(e) => {
        warn!(
          url = endpoint.url.as_str(),
          message = e.to_string(),
          "Webhook delivery failed"
        );
        failures += 1;
      }
    }
  }
  if failures > 0 {
    return Err(JobError::Retryable(anyhow!(
      "{}/{} webhook deliveries failed",
      failures,
      endpoints.len()
    )));
  }
  Ok(())
}

pub fn setup_webhook_jobs(
  app_context: &Arc<ApplicationContext>,
  shutdown: &CancellationToken,
) -> Result<()> {
  Arc::new(
    QueueRunnerBuilder::default()
      .descriptor(descriptor(QueueName::Webhook))
      .app_context(Arc::clone(app_context))
      .handler(job_handler!(deliver_webhook))
      .concurrency(2)
      .shutdown(shutdown.clone())
      .build()?,
  )
  .run();
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    context::ApplicationContext,
    helpers::test::test_sqlite_connection,
    queue::job::{Job, JobStatus},
  };
  use chrono::Utc;

  fn webhook_job(payload: &WebhookJobPayload) -> Job {
    Job {
      id: "job-1".to_string(),
      queue: QueueName::Webhook,
      payload: serde_json::to_vec(payload).unwrap(),
      priority: 0,
      group_id: payload.user_id.clone(),
      status: JobStatus::Running,
      runs_attempted: 1,
      max_retries: 3,
      next_run_at: Utc::now().naive_utc(),
      idempotency_key: None,
      lease_expires_at: None,
      last_error: None,
      enqueued_at: Utc::now().naive_utc(),
    }
  }

  async fn register_webhook(
    app_context: &Arc<ApplicationContext>,
    url: String,
    events: &str,
  ) -> Result<()> {
    let events = events.to_string();
    app_context
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "INSERT INTO webhooks (id, user_id, url, events) VALUES ('w1', 'u1', ?1, ?2)",
          params![url, events],
        )
      })
      .await
      .unwrap()?;
    Ok(())
  }

  #[tokio::test]
  async fn test_delivery_posts_to_subscribed_endpoints() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let delivered = server
      .mock("POST", "/hook")
      .match_body(mockito::Matcher::PartialJsonString(
        r#"{"event": "crawled", "bookmark_id": "bm1"}"#.to_string(),
      ))
      .with_status(200)
      .create_async()
      .await;

    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    register_webhook(&app_context, format!("{}/hook", server.url()), r#"["crawled"]"#).await?;

    let payload = WebhookJobPayload {
      bookmark_id: "bm1".to_string(),
      event: WebhookEvent::Crawled,
      user_id: Some("u1".to_string()),
    };
    deliver_webhook(JobContext {
      job: webhook_job(&payload),
      app_context,
      cancellation: CancellationToken::new(),
    })
    .await
    .map_err(|e| anyhow!(e.to_string()))?;

    delivered.assert_async().await;
    Ok(())
  }

  #[tokio::test]
  async fn test_rejected_delivery_fails_the_job() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("POST", "/hook")
      .with_status(500)
      .create_async()
      .await;

    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    register_webhook(&app_context, format!("{}/hook", server.url()), r#"["created"]"#).await?;

    let payload = WebhookJobPayload {
      bookmark_id: "bm1".to_string(),
      event: WebhookEvent::Created,
      user_id: Some("u1".to_string()),
    };
    let outcome = deliver_webhook(JobContext {
      job: webhook_job(&payload),
      app_context,
      cancellation: CancellationToken::new(),
    })
    .await;
    assert!(matches!(outcome, Err(JobError::Retryable(_))));
    Ok(())
  }

  #[tokio::test]
  async fn test_endpoints_filter_by_event() -> Result<()> {
    let (connection, _dir) = test_sqlite_connection().await?;
    let connection = Arc::new(connection);
    connection
      .write()
      .await?
      .interact(|conn| {
        conn.execute(
          "INSERT INTO webhooks (id, user_id, url, events) VALUES
             ('w1', 'u1', 'https://hooks.example/a', '[\"created\", \"crawled\"]'),
             ('w2', 'u1', 'https://hooks.example/b', '[\"deleted\"]'),
             ('w3', 'u2', 'https://hooks.example/c', '[\"crawled\"]')",
          [],
        )
      })
      .await
      .unwrap()?;

    let repository = WebhookRepository::new(connection);
    let endpoints = repository.find_for_event("u1", WebhookEvent::Crawled).await?;
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].url, "https://hooks.example/a");
    assert!(repository
      .find_for_event("u1", WebhookEvent::Edited)
      .await?
      .is_empty());
    Ok(())
  }
}
