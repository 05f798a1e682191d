use super::import_session::{StagingItem, StagingKind, StagingResult, StagingStatus};
use crate::{
  bookmarks::bookmark::{CrawlPriority, CrawlStatus, EnrichmentStatus, NewBookmark, NewBookmarkPayload},
  context::ApplicationContext,
  queue::job::QueueName,
};
use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::{spawn, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const STALE_SWEEP_EVERY: u64 = 60;

fn enrichment_is_terminal(status: Option<EnrichmentStatus>) -> bool {
  !matches!(status, Some(EnrichmentStatus::Pending))
}

fn crawl_is_terminal(status: Option<CrawlStatus>) -> bool {
  !matches!(status, Some(CrawlStatus::Pending))
}

/// Staged bulk-import poller: recovers stale claims, settles items whose
/// downstream work finished, and feeds new batches through the shared
/// bookmark-create path under queue backpressure.
pub struct ImportController {
  app_context: Arc<ApplicationContext>,
}

impl ImportController {
  pub fn new(app_context: Arc<ApplicationContext>) -> Self {
    Self { app_context }
  }

  pub fn spawn(self, shutdown: CancellationToken) {
    let poll_interval =
      Duration::from_secs(self.app_context.settings.import.poll_interval_seconds.max(1));
    spawn(async move {
      info!("Import controller started");
      let mut tick: u64 = 0;
      loop {
        tokio::select! {
          _ = sleep(poll_interval) => {}
          _ = shutdown.cancelled() => break,
        }
        tick += 1;
        if let Err(e) = self.tick(tick).await {
          error!(message = e.to_string(), "Import tick failed");
        }
      }
      info!("Import controller stopped");
    });
  }

  #[instrument(skip(self))]
  pub async fn tick(&self, tick: u64) -> Result<()> {
    let import = &self.app_context.import_repository;

    if tick % STALE_SWEEP_EVERY == 0 {
      let stale_threshold =
        Duration::from_secs(self.app_context.settings.import.stale_threshold_seconds);
      let reset = import.reset_stale_processing(stale_threshold).await?;
      if reset > 0 {
        warn!(count = reset, "Reset stale staging claims");
        self.app_context.metrics.record_import_stale_resets(reset as u64);
      }
    }

    import.release_paused_claims().await?;
    self.settle().await?;
    import.complete_drained_sessions().await?;

    let in_flight = self.in_flight().await?;
    self.emit_metrics(in_flight).await?;

    let max_in_flight = self.app_context.settings.import.max_in_flight as u64;
    if in_flight >= max_in_flight {
      return Ok(());
    }
    let capacity = (max_in_flight - in_flight) as u32;
    let batch_size = self.app_context.settings.import.batch_size.min(capacity);
    if batch_size == 0 {
      return Ok(());
    }

    let batch = import.claim_pending(batch_size).await?;
    if batch.is_empty() {
      return Ok(());
    }

    let batch_started = std::time::Instant::now();
    let outcomes = join_all(
      batch
        .into_iter()
        .map(|item| async move { self.process_item(item).await }),
    )
    .await;
    for outcome in outcomes {
      if let Err(e) = outcome {
        error!(message = e.to_string(), "Failed to process staging item");
      }
    }
    self
      .app_context
      .metrics
      .record_import_batch_duration(batch_started.elapsed().as_secs_f64());
    Ok(())
  }

  /// `in_flight` is the pessimistic view of work the controller has pushed
  /// downstream: whichever of the crawl queue, the inference queues, or its
  /// own claimed items is deepest.
  async fn in_flight(&self) -> Result<u64> {
    let queues = &self.app_context.queue_repository;
    let crawl_depth = queues.depth(QueueName::Crawl).await?;
    let inference_depth = queues
      .depth(QueueName::Tag)
      .await?
      .max(queues.depth(QueueName::Summarize).await?);
    let processing = self.app_context.import_repository.processing_count().await?;
    Ok(crawl_depth.max(inference_depth).max(processing))
  }

  /// Items whose bookmark finished crawl + tagging settle into a terminal
  /// staging status; failures downstream fail the item.
  async fn settle(&self) -> Result<()> {
    let import = &self.app_context.import_repository;
    for item in import.find_settling_items().await? {
      let Some(bookmark_id) = item.result_bookmark_id.clone() else {
        continue;
      };
      let Some(bookmark) = self
        .app_context
        .bookmark_repository
        .find(&bookmark_id)
        .await?
      else {
        import
          .finish_item(
            &item.id,
            StagingStatus::Failed,
            StagingResult::Rejected,
            Some("bookmark disappeared"),
          )
          .await?;
        self.app_context.metrics.record_import_result("rejected");
        continue;
      };

      let (crawl_status, tagging_status) = match &bookmark.link {
        Some(link) => (link.crawl_status, link.tagging_status),
        None => (None, None),
      };
      if !crawl_is_terminal(crawl_status) || !enrichment_is_terminal(tagging_status) {
        continue;
      }

      let crawl_failed = crawl_status == Some(CrawlStatus::Failure);
      let tagging_failed = tagging_status == Some(EnrichmentStatus::Failure);
      if crawl_failed || tagging_failed {
        let reason = if crawl_failed { "crawl failed" } else { "tagging failed" };
        import
          .finish_item(
            &item.id,
            StagingStatus::Failed,
            StagingResult::Accepted,
            Some(reason),
          )
          .await?;
        self.app_context.metrics.record_import_result("failed");
      } else {
        import
          .finish_item(&item.id, StagingStatus::Completed, StagingResult::Accepted, None)
          .await?;
        self.app_context.metrics.record_import_result("accepted");
      }
    }
    Ok(())
  }

  async fn process_item(&self, item: StagingItem) -> Result<()> {
    let import = &self.app_context.import_repository;
    let payload = match item.kind {
      StagingKind::Link => match item.url.clone() {
        Some(url) if !url.trim().is_empty() => NewBookmarkPayload::Link { url },
        _ => {
          import
            .finish_item(
              &item.id,
              StagingStatus::Failed,
              StagingResult::Rejected,
              Some("missing url"),
            )
            .await?;
          self.app_context.metrics.record_import_result("rejected");
          return Ok(());
        }
      },
      StagingKind::Text => match item.content.clone() {
        Some(content) if !content.trim().is_empty() => NewBookmarkPayload::Text {
          text: content,
          source_url: item.url.clone(),
        },
        _ => {
          import
            .finish_item(
              &item.id,
              StagingStatus::Failed,
              StagingResult::Rejected,
              Some("missing content"),
            )
            .await?;
          self.app_context.metrics.record_import_result("rejected");
          return Ok(());
        }
      },
    };

    let created = self
      .app_context
      .bookmark_interactor
      .create(NewBookmark {
        user_id: item.user_id.clone(),
        payload,
        title: item.title.clone(),
        crawl_priority: CrawlPriority::Low,
        archive_full_page: false,
      })
      .await;
    let created = match created {
      Ok(created) => created,
      Err(e) => {
        import
          .finish_item(
            &item.id,
            StagingStatus::Failed,
            StagingResult::Rejected,
            Some(&e.to_string()),
          )
          .await?;
        self.app_context.metrics.record_import_result("rejected");
        return Ok(());
      }
    };

    if created.duplicate {
      import
        .finish_item(
          &item.id,
          StagingStatus::Completed,
          StagingResult::SkippedDuplicate,
          None,
        )
        .await?;
      self
        .app_context
        .metrics
        .record_import_result("skipped_duplicate");
    } else {
      // Tags and list memberships ride the same business layer the API uses.
      if !item.tags.is_empty() {
        self
          .app_context
          .bookmark_repository
          .attach_tags(&created.bookmark.id, &item.user_id, item.tags.clone(), "human")
          .await?;
      }
      if !item.list_ids.is_empty() {
        self
          .app_context
          .bookmark_repository
          .add_to_lists(&created.bookmark.id, item.list_ids.clone())
          .await?;
      }
      import.record_bookmark(&item.id, &created.bookmark.id).await?;
    }

    import
      .touch_session(&item.session_id, Utc::now().naive_utc())
      .await?;
    Ok(())
  }

  async fn emit_metrics(&self, in_flight: u64) -> Result<()> {
    let metrics = &self.app_context.metrics;
    metrics.record_import_in_flight(in_flight);
    metrics.record_import_pending(self.app_context.import_repository.pending_count().await?);
    for (status, count) in self
      .app_context
      .import_repository
      .session_status_counts()
      .await?
    {
      metrics.record_import_sessions_active(&status, count);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::import::import_session::{NewStagingItem, SessionStatus};

  async fn seed_session(
    app_context: &Arc<ApplicationContext>,
    user_id: &str,
    urls: &[&str],
  ) -> Result<String> {
    let session_id = app_context
      .import_repository
      .create_session(user_id, "import", None)
      .await?;
    let items = urls
      .iter()
      .map(|url| NewStagingItem {
        kind: StagingKind::Link,
        url: Some(url.to_string()),
        content: None,
        title: None,
        tags: vec!["imported".to_string()],
        list_ids: vec![],
      })
      .collect();
    app_context
      .import_repository
      .add_staging_items(&session_id, items)
      .await?;
    app_context
      .import_repository
      .set_session_status(&session_id, SessionStatus::Pending)
      .await?;
    Ok(session_id)
  }

  #[tokio::test]
  async fn test_tick_claims_and_creates_bookmarks() -> Result<()> {
    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    let controller = ImportController::new(Arc::clone(&app_context));
    seed_session(&app_context, "u1", &["https://a.example/1", "https://a.example/2"]).await?;

    controller.tick(1).await?;

    // Both items claimed, bookmarks created, crawls enqueued at bulk
    // priority under the user's group.
    assert_eq!(app_context.import_repository.processing_count().await?, 2);
    assert_eq!(
      app_context
        .queue_repository
        .depth(QueueName::Crawl)
        .await?,
      2
    );
    let job = app_context
      .queue_repository
      .claim_next(QueueName::Crawl, Duration::from_secs(60))
      .await?
      .unwrap();
    assert_eq!(job.priority, crate::queue::job::PRIORITY_BULK);
    assert_eq!(job.group_id.as_deref(), Some("u1"));
    Ok(())
  }

  #[tokio::test]
  async fn test_duplicates_complete_as_skipped() -> Result<()> {
    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    let controller = ImportController::new(Arc::clone(&app_context));

    // The user already has this URL bookmarked interactively.
    app_context
      .bookmark_interactor
      .create(NewBookmark {
        user_id: "u1".to_string(),
        payload: NewBookmarkPayload::Link {
          url: "https://dup.example/x".to_string(),
        },
        title: None,
        crawl_priority: CrawlPriority::Normal,
        archive_full_page: false,
      })
      .await?;
    let session_id = seed_session(&app_context, "u1", &["https://dup.example/x"]).await?;

    controller.tick(1).await?;
    assert!(
      app_context.import_repository.find_settling_items().await?.is_empty(),
      "a skipped duplicate settles immediately"
    );
    assert_eq!(app_context.import_repository.processing_count().await?, 0);

    controller.tick(2).await?;
    assert_eq!(
      app_context
        .import_repository
        .find_session(&session_id)
        .await?
        .unwrap()
        .status,
      SessionStatus::Completed
    );
    // Only the interactive bookmark's crawl exists.
    assert_eq!(
      app_context.queue_repository.depth(QueueName::Crawl).await?,
      1
    );
    Ok(())
  }

  #[tokio::test]
  async fn test_backpressure_skips_claiming() -> Result<()> {
    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    let controller = ImportController::new(Arc::clone(&app_context));
    let urls = (0..10)
      .map(|i| format!("https://bp.example/{i}"))
      .collect::<Vec<_>>();
    seed_session(
      &app_context,
      "u1",
      &urls.iter().map(String::as_str).collect::<Vec<_>>(),
    )
    .await?;

    // max_in_flight = 4 in the test settings; batch_size = 3.
    controller.tick(1).await?;
    let first_wave = app_context.import_repository.processing_count().await?;
    assert!(first_wave <= 4, "claims bounded by capacity, got {first_wave}");

    controller.tick(2).await?;
    let second_wave = app_context.import_repository.processing_count().await?;
    assert!(
      second_wave <= 4 + 3,
      "backpressure lag bounded by one batch, got {second_wave}"
    );
    Ok(())
  }

  #[tokio::test]
  async fn test_settle_completes_terminal_items() -> Result<()> {
    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    let controller = ImportController::new(Arc::clone(&app_context));
    let session_id = seed_session(&app_context, "u1", &["https://settle.example/1"]).await?;
    controller.tick(1).await?;

    let item = app_context
      .import_repository
      .find_settling_items()
      .await?
      .pop()
      .unwrap();
    let bookmark_id = item.result_bookmark_id.clone().unwrap();

    // Still pending downstream: the item must not settle yet.
    controller.tick(2).await?;
    assert_eq!(app_context.import_repository.processing_count().await?, 1);

    // Crawl succeeds, tagging terminal (never requested -> null).
    app_context
      .bookmark_repository
      .update_link_metadata(&bookmark_id, Default::default())
      .await?;
    controller.tick(3).await?;
    assert_eq!(app_context.import_repository.processing_count().await?, 0);
    assert_eq!(
      app_context
        .import_repository
        .find_session(&session_id)
        .await?
        .unwrap()
        .status,
      SessionStatus::Completed
    );
    Ok(())
  }

  #[tokio::test]
  async fn test_settle_fails_items_on_crawl_failure() -> Result<()> {
    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    let controller = ImportController::new(Arc::clone(&app_context));
    seed_session(&app_context, "u1", &["https://broken.example/1"]).await?;
    controller.tick(1).await?;

    let item = app_context
      .import_repository
      .find_settling_items()
      .await?
      .pop()
      .unwrap();
    app_context
      .bookmark_repository
      .mark_crawl_failure(&item.result_bookmark_id.clone().unwrap(), Some(500))
      .await?;

    controller.tick(2).await?;
    assert_eq!(app_context.import_repository.processing_count().await?, 0);
    Ok(())
  }

  #[tokio::test]
  async fn test_paused_sessions_release_claims() -> Result<()> {
    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    let controller = ImportController::new(Arc::clone(&app_context));
    let session_id = seed_session(&app_context, "u1", &["https://paused.example/1"]).await?;

    // Claim while pending, then pause before the bookmark exists.
    app_context.import_repository.claim_pending(5).await?;
    app_context
      .import_repository
      .set_session_status(&session_id, SessionStatus::Paused)
      .await?;

    controller.tick(1).await?;
    assert_eq!(app_context.import_repository.processing_count().await?, 0);
    assert_eq!(app_context.import_repository.pending_count().await?, 1);

    // Paused sessions are not claim sources.
    controller.tick(2).await?;
    assert_eq!(app_context.import_repository.processing_count().await?, 0);
    Ok(())
  }

  #[tokio::test]
  async fn test_fairness_rotates_across_sessions() -> Result<()> {
    let (app_context, _dir) = ApplicationContext::test_instance().await?;
    seed_session(&app_context, "u1", &["https://f.example/1", "https://f.example/2"]).await?;
    let s2 = seed_session(&app_context, "u2", &["https://g.example/1"]).await?;

    // u2's session was served long ago; u1's never. Never-served wins, and
    // after u1 is touched the rotation moves to u2.
    app_context
      .import_repository
      .touch_session(&s2, Utc::now().naive_utc())
      .await?;

    let first = app_context.import_repository.claim_pending(1).await?;
    assert_eq!(first[0].user_id, "u1");
    app_context
      .import_repository
      .touch_session(&first[0].session_id, Utc::now().naive_utc())
      .await?;

    let second = app_context.import_repository.claim_pending(1).await?;
    assert_eq!(second[0].user_id, "u2");
    Ok(())
  }
}
