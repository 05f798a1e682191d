use super::{
  bookmark::{Bookmark, BookmarkKind, EnrichmentStatus, NewBookmark, NewBookmarkPayload},
  bookmark_repository::BookmarkRepository,
};
use crate::{
  assets::asset_jobs::AssetPreprocessingJobPayload,
  crawler::crawler_jobs::CrawlJobPayload,
  enrichment::enrichment_jobs::{EnrichmentJobPayload, EnrichmentKind},
  hooks::{
    rule_engine::{RuleEngineJobPayload, RuleEvent},
    webhook_jobs::{WebhookEvent, WebhookJobPayload},
  },
  queue::{
    job::QueueName,
    job_queue::{EnqueueParametersBuilder, JobQueue},
    queue_repository::QueueRepository,
  },
  search::search_jobs::{SearchIndexJobPayload, SearchOperation},
};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct CreatedBookmark {
  pub bookmark: Bookmark,
  pub duplicate: bool,
}

/// The single bookmark-create path. The request-facing API and the import
/// controller both come through here, so crawl scheduling, fan-out and
/// duplicate handling behave identically for interactive and bulk traffic.
pub struct BookmarkInteractor {
  repository: Arc<BookmarkRepository>,
  queue_repository: Arc<QueueRepository>,
}

impl BookmarkInteractor {
  pub fn new(
    repository: Arc<BookmarkRepository>,
    queue_repository: Arc<QueueRepository>,
  ) -> Self {
    Self {
      repository,
      queue_repository,
    }
  }

  pub fn repository(&self) -> &BookmarkRepository {
    &self.repository
  }

  #[instrument(skip(self, record), fields(user_id = record.user_id.as_str()))]
  pub async fn create(&self, record: NewBookmark) -> Result<CreatedBookmark> {
    if let NewBookmarkPayload::Link { url } = &record.payload {
      if let Some(existing_id) = self
        .repository
        .find_link_by_url(&record.user_id, url)
        .await?
      {
        info!(
          bookmark_id = existing_id.as_str(),
          "Duplicate URL, returning existing bookmark"
        );
        let bookmark = self
          .repository
          .find(&existing_id)
          .await?
          .ok_or_else(|| anyhow::anyhow!("Duplicate bookmark vanished"))?;
        return Ok(CreatedBookmark {
          bookmark,
          duplicate: true,
        });
      }
    }

    let priority = record.crawl_priority.as_queue_priority();
    let archive_full_page = record.archive_full_page;
    let bookmark = self.repository.insert(record).await?;

    match bookmark.kind {
      BookmarkKind::Link => {
        self
          .enqueue_crawl(&bookmark, priority, archive_full_page)
          .await?;
      }
      BookmarkKind::Text => {
        self.request_enrichment(&bookmark, priority).await?;
        self.enqueue_search_upsert(&bookmark, priority).await?;
      }
      BookmarkKind::Asset => {
        let queue = JobQueue::<AssetPreprocessingJobPayload>::new(
          Arc::clone(&self.queue_repository),
          QueueName::AssetPreprocessing,
        );
        queue
          .enqueue(
            &AssetPreprocessingJobPayload {
              bookmark_id: bookmark.id.clone(),
              fix_mode: false,
            },
            EnqueueParametersBuilder::default()
              .priority(priority)
              .group_id(bookmark.user_id.clone())
              .build()?,
          )
          .await?;
      }
    }

    self
      .notify(&bookmark, WebhookEvent::Created, RuleEvent::BookmarkAdded, priority)
      .await?;

    Ok(CreatedBookmark {
      bookmark,
      duplicate: false,
    })
  }

  pub async fn enqueue_crawl(
    &self,
    bookmark: &Bookmark,
    priority: u32,
    archive_full_page: bool,
  ) -> Result<String> {
    let queue =
      JobQueue::<CrawlJobPayload>::new(Arc::clone(&self.queue_repository), QueueName::Crawl);
    queue
      .enqueue(
        &CrawlJobPayload {
          bookmark_id: bookmark.id.clone(),
          archive_full_page: Some(archive_full_page),
          store_pdf: None,
          run_inference: None,
        },
        EnqueueParametersBuilder::default()
          .priority(priority)
          .group_id(bookmark.user_id.clone())
          .idempotency_key(format!("crawl:{}", bookmark.id))
          .build()?,
      )
      .await
  }

  /// Tag + summarize, with the pending statuses set up front so the UI can
  /// show work in progress.
  pub async fn request_enrichment(&self, bookmark: &Bookmark, priority: u32) -> Result<()> {
    if bookmark.kind == BookmarkKind::Link {
      self
        .repository
        .set_tagging_status(&bookmark.id, Some(EnrichmentStatus::Pending))
        .await?;
      self
        .repository
        .set_summarization_status(&bookmark.id, Some(EnrichmentStatus::Pending))
        .await?;
    }
    for kind in [EnrichmentKind::Tag, EnrichmentKind::Summarize] {
      let queue_name = match kind {
        EnrichmentKind::Tag => QueueName::Tag,
        EnrichmentKind::Summarize => QueueName::Summarize,
      };
      let queue =
        JobQueue::<EnrichmentJobPayload>::new(Arc::clone(&self.queue_repository), queue_name);
      queue
        .enqueue(
          &EnrichmentJobPayload {
            bookmark_id: bookmark.id.clone(),
            kind,
          },
          EnqueueParametersBuilder::default()
            .priority(priority)
            .group_id(bookmark.user_id.clone())
            .idempotency_key(format!("{}:{}", queue_name, bookmark.id))
            .build()?,
        )
        .await?;
    }
    Ok(())
  }

  pub async fn enqueue_search_upsert(&self, bookmark: &Bookmark, priority: u32) -> Result<()> {
    let queue = JobQueue::<SearchIndexJobPayload>::new(
      Arc::clone(&self.queue_repository),
      QueueName::SearchIndex,
    );
    queue
      .enqueue(
        &SearchIndexJobPayload {
          bookmark_id: bookmark.id.clone(),
          operation: SearchOperation::Upsert,
        },
        EnqueueParametersBuilder::default()
          .priority(priority)
          .group_id(bookmark.user_id.clone())
          .build()?,
      )
      .await?;
    Ok(())
  }

  /// Webhooks and the rule engine fire for every bookmark mutation,
  /// including ones with inference disabled.
  pub async fn notify(
    &self,
    bookmark: &Bookmark,
    webhook_event: WebhookEvent,
    rule_event: RuleEvent,
    priority: u32,
  ) -> Result<()> {
    let webhooks =
      JobQueue::<WebhookJobPayload>::new(Arc::clone(&self.queue_repository), QueueName::Webhook);
    webhooks
      .enqueue(
        &WebhookJobPayload {
          bookmark_id: bookmark.id.clone(),
          event: webhook_event,
          user_id: Some(bookmark.user_id.clone()),
        },
        EnqueueParametersBuilder::default()
          .priority(priority)
          .group_id(bookmark.user_id.clone())
          .build()?,
      )
      .await?;

    let rules = JobQueue::<RuleEngineJobPayload>::new(
      Arc::clone(&self.queue_repository),
      QueueName::RuleEngine,
    );
    rules
      .enqueue(
        &RuleEngineJobPayload {
          bookmark_id: bookmark.id.clone(),
          events: vec![rule_event],
        },
        EnqueueParametersBuilder::default()
          .priority(priority)
          .group_id(bookmark.user_id.clone())
          .build()?,
      )
      .await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    bookmarks::bookmark::CrawlPriority,
    helpers::test::test_sqlite_connection,
    queue::job::{JobStatus, PRIORITY_BULK},
  };

  async fn test_interactor() -> Result<(BookmarkInteractor, Arc<QueueRepository>, tempfile::TempDir)>
  {
    let (connection, dir) = test_sqlite_connection().await?;
    let connection = Arc::new(connection);
    let queue_repository = Arc::new(QueueRepository::new(Arc::clone(&connection)));
    let interactor = BookmarkInteractor::new(
      Arc::new(BookmarkRepository::new(connection)),
      Arc::clone(&queue_repository),
    );
    Ok((interactor, queue_repository, dir))
  }

  fn new_link(url: &str, priority: CrawlPriority) -> NewBookmark {
    NewBookmark {
      user_id: "u1".to_string(),
      payload: NewBookmarkPayload::Link {
        url: url.to_string(),
      },
      title: None,
      crawl_priority: priority,
      archive_full_page: false,
    }
  }

  #[tokio::test]
  async fn test_create_link_enqueues_crawl_and_fanout() -> Result<()> {
    let (interactor, queues, _dir) = test_interactor().await?;
    let created = interactor
      .create(new_link("https://example.com", CrawlPriority::Low))
      .await?;
    assert!(!created.duplicate);

    let crawl = queues
      .claim_next(QueueName::Crawl, std::time::Duration::from_secs(60))
      .await?
      .unwrap();
    assert_eq!(crawl.priority, PRIORITY_BULK);
    assert_eq!(crawl.group_id.as_deref(), Some("u1"));
    let payload: CrawlJobPayload = crawl.payload_as()?;
    assert_eq!(payload.bookmark_id, created.bookmark.id);

    assert_eq!(queues.depth(QueueName::Webhook).await?, 1);
    assert_eq!(queues.depth(QueueName::RuleEngine).await?, 1);
    Ok(())
  }

  #[tokio::test]
  async fn test_create_duplicate_url_skips_enqueue() -> Result<()> {
    let (interactor, queues, _dir) = test_interactor().await?;
    let first = interactor
      .create(new_link("https://example.com", CrawlPriority::Normal))
      .await?;
    let second = interactor
      .create(new_link("https://example.com", CrawlPriority::Normal))
      .await?;

    assert!(second.duplicate);
    assert_eq!(second.bookmark.id, first.bookmark.id);
    assert_eq!(queues.depth(QueueName::Crawl).await?, 1);
    Ok(())
  }

  #[tokio::test]
  async fn test_create_text_requests_enrichment_and_indexing() -> Result<()> {
    let (interactor, queues, _dir) = test_interactor().await?;
    interactor
      .create(NewBookmark {
        user_id: "u1".to_string(),
        payload: NewBookmarkPayload::Text {
          text: "remember this".to_string(),
          source_url: None,
        },
        title: None,
        crawl_priority: CrawlPriority::Normal,
        archive_full_page: false,
      })
      .await?;

    assert_eq!(queues.depth(QueueName::Crawl).await?, 0);
    assert_eq!(queues.depth(QueueName::Tag).await?, 1);
    assert_eq!(queues.depth(QueueName::Summarize).await?, 1);
    assert_eq!(queues.depth(QueueName::SearchIndex).await?, 1);
    Ok(())
  }

  #[tokio::test]
  async fn test_repeated_crawl_enqueue_collapses() -> Result<()> {
    let (interactor, queues, _dir) = test_interactor().await?;
    let created = interactor
      .create(new_link("https://example.com", CrawlPriority::Normal))
      .await?;
    for _ in 0..3 {
      interactor
        .enqueue_crawl(&created.bookmark, 0, false)
        .await?;
    }
    assert_eq!(queues.depth(QueueName::Crawl).await?, 1);

    // Once dispatched and completed, a new enqueue opens a fresh job.
    let job = queues
      .claim_next(QueueName::Crawl, std::time::Duration::from_secs(60))
      .await?
      .unwrap();
    assert_eq!(job.status, JobStatus::Running);
    queues.complete(&job.id, false).await?;
    interactor.enqueue_crawl(&created.bookmark, 0, false).await?;
    assert_eq!(queues.depth(QueueName::Crawl).await?, 1);
    Ok(())
  }
}
