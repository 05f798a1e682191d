use super::{
  archive::Archiver,
  browser::{install_navigation_guards, AcquiredContext, BrowserHandle},
  rate_limiter::{DomainRateLimiter, RateLimitBucket},
  url_policy::UrlPolicy,
};
use crate::{
  assets::asset_manager::{AssetManager, StagedAsset},
  bookmarks::{
    bookmark::{
      AssetRole, Bookmark, BookmarkAsset, BookmarkKind, CrawlFinalization, CrawlMetadataUpdate,
      NewAsset,
    },
    bookmark_interactor::BookmarkInteractor,
    bookmark_repository::BookmarkRepository,
  },
  crawler::crawler_jobs::CrawlJobPayload,
  helpers::backoff::retry_after_jitter,
  hooks::{rule_engine::RuleEvent, webhook_jobs::WebhookEvent},
  metrics::AppMetrics,
  parser::{
    bridge::{ParserBridge, ParserError},
    extract::{ExtractedPage, PageMetadata},
  },
  queue::{
    job::{Job, JobError, QueueName, PRIORITY_USER},
    job_queue::{EnqueueParametersBuilder, JobQueue},
    queue_repository::QueueRepository,
  },
  settings::Settings,
};
use anyhow::{anyhow, Result};
use chromiumoxide::cdp::browser_protocol::page::{
  CaptureScreenshotFormat, CaptureScreenshotParams, PrintToPdfParams,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::StreamExt;
use reqwest::Proxy;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use url::Url;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const NETWORK_IDLE_CAP: Duration = Duration::from_secs(5);
const BANNER_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);
const DOMAIN_BUCKET: &str = "crawler-domain";

const SUPPORTED_BINARY_TYPES: [&str; 5] = [
  "application/pdf",
  "image/png",
  "image/jpeg",
  "image/webp",
  "image/gif",
];

fn is_retryable_status(status: u16) -> bool {
  status == 403 || status == 429 || status >= 500
}

/// Content strictly below the threshold lives inline on the row; anything
/// at or above it becomes a blob.
fn stores_html_inline(content_bytes: usize, threshold: u64) -> bool {
  (content_bytes as u64) < threshold
}

struct CapturedPage {
  html: String,
  status_code: Option<u16>,
  screenshot: Option<Vec<u8>>,
  pdf: Option<Vec<u8>>,
}

/// Enriches one link bookmark: probe, browser capture, subprocess parse,
/// two-phase persistence, follow-up fan-out, optional archive.
pub struct Crawler {
  settings: Arc<Settings>,
  client: ClientWithMiddleware,
  browser: Arc<BrowserHandle>,
  parser: ParserBridge,
  archiver: Archiver,
  rate_limiter: Arc<DomainRateLimiter>,
  url_policy: Arc<UrlPolicy>,
  bookmark_repository: Arc<BookmarkRepository>,
  bookmark_interactor: Arc<BookmarkInteractor>,
  asset_manager: Arc<AssetManager>,
  queue_repository: Arc<QueueRepository>,
  metrics: AppMetrics,
}

impl Crawler {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    settings: Arc<Settings>,
    browser: Arc<BrowserHandle>,
    rate_limiter: Arc<DomainRateLimiter>,
    bookmark_repository: Arc<BookmarkRepository>,
    bookmark_interactor: Arc<BookmarkInteractor>,
    asset_manager: Arc<AssetManager>,
    queue_repository: Arc<QueueRepository>,
    metrics: AppMetrics,
  ) -> Result<Self> {
    let url_policy = Arc::new(match &settings.crawler.blocklist_path {
      Some(path) if settings.crawler.enable_adblocker => UrlPolicy::with_blocklist_file(path)?,
      _ => UrlPolicy::new(),
    });

    let mut base_client_builder = reqwest::ClientBuilder::new();
    if let Some(proxy) = settings.proxy.pick_http_proxy() {
      base_client_builder = base_client_builder.proxy(Proxy::http(proxy)?);
    }
    if let Some(proxy) = settings.proxy.pick_https_proxy() {
      base_client_builder = base_client_builder.proxy(Proxy::https(proxy)?);
    }
    let base_client = base_client_builder
      .build()
      .map_err(|error| anyhow::Error::msg(error.to_string()))?;
    let client = ClientBuilder::new(base_client)
      .with(TracingMiddleware::default())
      .build();

    Ok(Self {
      parser: ParserBridge::new(Arc::clone(&settings)),
      archiver: Archiver::new(Arc::clone(&settings)),
      settings,
      client,
      browser,
      rate_limiter,
      url_policy,
      bookmark_repository,
      bookmark_interactor,
      asset_manager,
      queue_repository,
      metrics,
    })
  }

  fn domain_bucket(&self) -> RateLimitBucket {
    RateLimitBucket {
      name: DOMAIN_BUCKET.to_string(),
      max_requests: self.settings.crawler.domain_ratelimiting.max_requests,
      window: Duration::from_millis(self.settings.crawler.domain_ratelimiting.window_ms),
    }
  }

  fn ensure_live(cancellation: &CancellationToken) -> Result<(), JobError> {
    if cancellation.is_cancelled() {
      Err(JobError::Cancelled)
    } else {
      Ok(())
    }
  }

  #[instrument(skip_all, fields(bookmark_id = payload.bookmark_id.as_str(), job_id = job.id.as_str()))]
  pub async fn crawl(
    &self,
    payload: CrawlJobPayload,
    job: &Job,
    cancellation: &CancellationToken,
  ) -> Result<(), JobError> {
    let bookmark = self
      .bookmark_repository
      .find(&payload.bookmark_id)
      .await?
      .ok_or_else(|| JobError::fatal("Bookmark no longer exists"))?;
    if bookmark.kind != BookmarkKind::Link {
      info!("Bookmark is no longer a link, nothing to crawl");
      return Ok(());
    }
    let link = bookmark
      .link()
      .cloned()
      .ok_or_else(|| JobError::fatal("Link bookmark has no link row"))?;
    let url = Url::parse(&link.url)
      .map_err(|e| JobError::Fatal(anyhow!("Invalid bookmark url: {}", e)))?;
    self
      .url_policy
      .validate(&url)
      .map_err(|violation| JobError::Fatal(violation.into()))?;
    let host = url
      .host_str()
      .ok_or_else(|| JobError::fatal("Bookmark url has no host"))?;

    // Domain gate first: a denied job must not touch the bookmark row.
    let decision = self.rate_limiter.check(&self.domain_bucket(), host).await;
    if !decision.allowed {
      let reset = Duration::from_secs(decision.reset_in_seconds.unwrap_or(1).max(1));
      return Err(JobError::RetryAfter(retry_after_jitter(reset)));
    }

    let first_crawl = link.crawled_at.is_none();
    self.bookmark_repository.begin_crawl(&bookmark.id).await?;
    Self::ensure_live(cancellation)?;

    let captured = if let Some(archive) = bookmark.asset_with_role(AssetRole::PrecrawledArchive) {
      // A user-uploaded archive short-circuits the whole network phase.
      let bytes = self
        .asset_manager
        .fetch(&bookmark.user_id, &archive.id)
        .await?;
      CapturedPage {
        html: String::from_utf8_lossy(&bytes).into_owned(),
        status_code: None,
        screenshot: None,
        pdf: None,
      }
    } else {
      match self
        .fetch_page(&bookmark, &payload, &url, job, cancellation)
        .await?
      {
        Some(captured) => captured,
        // The bookmark morphed into an asset; the pipeline is done.
        None => return Ok(()),
      }
    };
    Self::ensure_live(cancellation)?;

    let parsed = match self
      .parser
      .parse(
        captured.html.clone(),
        url.to_string(),
        job.id.clone(),
        cancellation,
      )
      .await
    {
      Ok(parsed) => parsed,
      Err(ParserError::Timeout) if cancellation.is_cancelled() => return Err(JobError::Cancelled),
      Err(e) => return Err(JobError::Retryable(e.into())),
    };

    self
      .persist_phase_one(&bookmark, &url, &parsed, captured.status_code)
      .await?;
    Self::ensure_live(cancellation)?;

    let superseded = self
      .persist_phase_two(&bookmark, &url, &parsed, &captured, cancellation)
      .await?;
    self.enqueue_asset_deletions(&bookmark, superseded).await?;

    self
      .enqueue_followups(&bookmark, &payload, &link.url, job)
      .await?;

    if payload.archive_full_page.unwrap_or(false) || self.settings.crawler.full_page_archive {
      self
        .archive_page(&bookmark, &captured.html, &link.url, cancellation)
        .await;
    }

    if first_crawl && job.priority == PRIORITY_USER {
      let elapsed = Utc::now().naive_utc() - bookmark.created_at;
      self
        .metrics
        .record_crawl_latency(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
    }

    info!("Crawl finished");
    Ok(())
  }

  /// Probe + browser phase. Returns None when the bookmark morphed into an
  /// asset bookmark (PDF or image URL).
  async fn fetch_page(
    &self,
    bookmark: &Bookmark,
    payload: &CrawlJobPayload,
    url: &Url,
    job: &Job,
    cancellation: &CancellationToken,
  ) -> Result<Option<CapturedPage>, JobError> {
    let response = tokio::select! {
      response = timeout(PROBE_TIMEOUT, self.client.get(url.clone()).send()) => {
        response
          .map_err(|_| JobError::retryable("Content probe timed out"))?
          .map_err(|e| JobError::Retryable(anyhow!("Content probe failed: {}", e)))?
      }
      _ = cancellation.cancelled() => return Err(JobError::Cancelled),
    };
    let status = response.status().as_u16();
    self.metrics.record_crawler_status_code(status);
    if is_retryable_status(status) {
      return Err(JobError::Retryable(anyhow!(
        "Crawl blocked with status {}",
        status
      )));
    }
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|value| value.to_str().ok())
      .map(|value| {
        value
          .split(';')
          .next()
          .unwrap_or_default()
          .trim()
          .to_ascii_lowercase()
      });

    if let Some(content_type) = content_type
      .as_deref()
      .filter(|ct| SUPPORTED_BINARY_TYPES.contains(ct))
    {
      let content_type = content_type.to_string();
      self
        .morph_to_asset_bookmark(bookmark, url, &content_type, response, job, cancellation)
        .await?;
      return Ok(None);
    }

    let captured = match self.browser.acquire(&job.id).await? {
      Some(context) => {
        let result = self
          .capture_with_browser(&context, payload, url, cancellation)
          .await;
        self.browser.close_context(context).await;
        result?
      }
      None => self.fetch_browserless(url, status, cancellation).await?,
    };
    Ok(Some(captured))
  }

  async fn capture_with_browser(
    &self,
    context: &AcquiredContext,
    payload: &CrawlJobPayload,
    url: &Url,
    cancellation: &CancellationToken,
  ) -> Result<CapturedPage, JobError> {
    let crawler_settings = &self.settings.crawler;
    let guard_token = cancellation.child_token();
    install_navigation_guards(
      &context.page,
      Arc::clone(&self.url_policy),
      guard_token.clone(),
    )
    .await
    .map_err(JobError::Retryable)?;

    let navigate_timeout = Duration::from_secs(crawler_settings.navigate_timeout_seconds);
    let navigation = tokio::select! {
      result = timeout(navigate_timeout, context.page.goto(url.to_string())) => result,
      _ = cancellation.cancelled() => {
        guard_token.cancel();
        return Err(JobError::Cancelled);
      }
    };
    match navigation {
      Ok(Ok(_)) => {}
      Ok(Err(e)) => {
        guard_token.cancel();
        return Err(JobError::Retryable(anyhow!("Navigation failed: {}", e)));
      }
      Err(_) => {
        guard_token.cancel();
        return Err(JobError::Retryable(anyhow!("Navigation timed out")));
      }
    }
    // Best-effort settle after domcontentloaded, hard-capped.
    let _ = timeout(NETWORK_IDLE_CAP, context.page.wait_for_navigation()).await;

    let capture_timeout = Duration::from_secs(crawler_settings.screenshot_timeout_seconds);
    let html_future = context.page.content();
    let screenshot_page = context.page.clone();
    let screenshot_future = async {
      if !crawler_settings.store_screenshot {
        return None;
      }
      let params = CaptureScreenshotParams {
        format: Some(CaptureScreenshotFormat::Jpeg),
        quality: Some(80),
        capture_beyond_viewport: Some(crawler_settings.full_page_screenshot),
        ..Default::default()
      };
      match timeout(capture_timeout, screenshot_page.screenshot(params)).await {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(e)) => {
          warn!(message = e.to_string(), "Screenshot failed, continuing without one");
          None
        }
        Err(_) => {
          warn!("Screenshot timed out, continuing without one");
          None
        }
      }
    };
    let pdf_page = context.page.clone();
    let store_pdf = crawler_settings.store_pdf || payload.store_pdf.unwrap_or(false);
    let pdf_future = async {
      if !store_pdf {
        return None;
      }
      match timeout(capture_timeout, pdf_page.pdf(PrintToPdfParams::default())).await {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(e)) => {
          warn!(message = e.to_string(), "PDF capture failed, continuing without one");
          None
        }
        Err(_) => {
          warn!("PDF capture timed out, continuing without one");
          None
        }
      }
    };

    let (html, screenshot, pdf) = tokio::select! {
      captures = futures::future::join3(html_future, screenshot_future, pdf_future) => captures,
      _ = cancellation.cancelled() => {
        guard_token.cancel();
        return Err(JobError::Cancelled);
      }
    };
    guard_token.cancel();

    Ok(CapturedPage {
      html: html
        .map_err(|e| JobError::Retryable(anyhow!("Failed to read page content: {}", e)))?,
      status_code: None,
      screenshot,
      pdf,
    })
  }

  /// Degraded crawl: one plain GET, no screenshots, no PDF.
  async fn fetch_browserless(
    &self,
    url: &Url,
    status: u16,
    cancellation: &CancellationToken,
  ) -> Result<CapturedPage, JobError> {
    let html = tokio::select! {
      response = timeout(PROBE_TIMEOUT, self.client.get(url.clone()).send()) => {
        response
          .map_err(|_| JobError::retryable("Browserless fetch timed out"))?
          .map_err(|e| JobError::Retryable(anyhow!("Browserless fetch failed: {}", e)))?
          .text()
          .await
          .map_err(|e| JobError::Retryable(anyhow!("Browserless fetch failed: {}", e)))?
      }
      _ = cancellation.cancelled() => return Err(JobError::Cancelled),
    };
    Ok(CapturedPage {
      html,
      status_code: Some(status),
      screenshot: None,
      pdf: None,
    })
  }

  /// The URL serves a binary we support: stream it under the size cap, flip
  /// the bookmark to an asset bookmark, hand off to asset preprocessing.
  async fn morph_to_asset_bookmark(
    &self,
    bookmark: &Bookmark,
    url: &Url,
    content_type: &str,
    response: reqwest::Response,
    job: &Job,
    cancellation: &CancellationToken,
  ) -> Result<(), JobError> {
    let bytes = self
      .read_bounded_body(response, cancellation)
      .await?
      .ok_or_else(|| JobError::fatal("Downloaded file exceeds the asset size cap"))?;

    let file_name = url
      .path_segments()
      .and_then(|segments| segments.last())
      .filter(|segment| !segment.is_empty())
      .map(|segment| segment.to_string());
    let staged = self
      .asset_manager
      .stage(
        &bookmark.user_id,
        AssetRole::Primary,
        content_type,
        file_name,
        Some(url.to_string()),
        &bytes,
      )
      .await?;
    let StagedAsset::Stored(asset) = staged else {
      return Err(JobError::fatal("Storage quota exhausted for downloaded file"));
    };

    self
      .bookmark_repository
      .morph_to_asset(&bookmark.id, asset)
      .await?;
    info!(content_type, "Bookmark morphed from link to asset");

    let queue = JobQueue::<crate::assets::asset_jobs::AssetPreprocessingJobPayload>::new(
      Arc::clone(&self.queue_repository),
      QueueName::AssetPreprocessing,
    );
    queue
      .enqueue(
        &crate::assets::asset_jobs::AssetPreprocessingJobPayload {
          bookmark_id: bookmark.id.clone(),
          fix_mode: false,
        },
        EnqueueParametersBuilder::default()
          .priority(job.priority)
          .group_id(bookmark.user_id.clone())
          .build()
          .map_err(|e| JobError::Retryable(e.into()))?,
      )
      .await?;
    Ok(())
  }

  async fn read_bounded_body(
    &self,
    response: reqwest::Response,
    cancellation: &CancellationToken,
  ) -> Result<Option<Vec<u8>>, JobError> {
    let cap = self.settings.max_asset_size_bytes() as usize;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    loop {
      let chunk = tokio::select! {
        chunk = stream.next() => chunk,
        _ = cancellation.cancelled() => return Err(JobError::Cancelled),
      };
      match chunk {
        Some(Ok(chunk)) => {
          if body.len() + chunk.len() > cap {
            return Ok(None);
          }
          body.extend_from_slice(&chunk);
        }
        Some(Err(e)) => {
          return Err(JobError::Retryable(anyhow!("Download failed: {}", e)));
        }
        None => return Ok(Some(body)),
      }
    }
  }

  async fn persist_phase_one(
    &self,
    bookmark: &Bookmark,
    url: &Url,
    parsed: &ExtractedPage,
    status_code: Option<u16>,
  ) -> Result<()> {
    let metadata = &parsed.metadata;
    let favicon = metadata
      .logo
      .clone()
      .or_else(|| url.join("/favicon.ico").ok().map(|u| u.to_string()));
    self
      .bookmark_repository
      .update_link_metadata(
        &bookmark.id,
        CrawlMetadataUpdate {
          title: metadata.title.clone(),
          description: metadata.description.clone(),
          author: metadata.author.clone(),
          publisher: metadata.publisher.clone(),
          date_published: parse_metadata_date(metadata.date_published.as_deref()),
          date_modified: parse_metadata_date(metadata.date_modified.as_deref()),
          favicon,
          image_url: metadata.image.clone(),
          crawl_status_code: status_code,
        },
      )
      .await
  }

  /// Quota-checked asset storage followed by the phase-2 transaction.
  async fn persist_phase_two(
    &self,
    bookmark: &Bookmark,
    url: &Url,
    parsed: &ExtractedPage,
    captured: &CapturedPage,
    cancellation: &CancellationToken,
  ) -> Result<Vec<BookmarkAsset>, JobError> {
    let mut new_assets: Vec<NewAsset> = Vec::new();

    let screenshot_future = self.stage_optional(
      bookmark,
      AssetRole::Screenshot,
      "image/jpeg",
      captured.screenshot.as_deref(),
    );
    let pdf_future = self.stage_optional(
      bookmark,
      AssetRole::Pdf,
      "application/pdf",
      captured.pdf.as_deref(),
    );
    let banner_future = self.download_banner(bookmark, &parsed.metadata, cancellation);
    let (screenshot, pdf, banner) =
      futures::future::join3(screenshot_future, pdf_future, banner_future).await;
    new_assets.extend(screenshot);
    new_assets.extend(pdf);
    new_assets.extend(banner);

    let readable = parsed
      .readable_content
      .as_ref()
      .map(|content| content.content.clone());
    let mut html_content = None;
    let mut content_asset_id = None;
    if let Some(content) = readable {
      if stores_html_inline(
        content.len(),
        self.settings.crawler.html_content_size_threshold,
      ) {
        html_content = Some(content);
      } else {
        match self
          .asset_manager
          .stage(
            &bookmark.user_id,
            AssetRole::HtmlContent,
            "text/html",
            None,
            Some(url.to_string()),
            content.as_bytes(),
          )
          .await?
        {
          StagedAsset::Stored(asset) => {
            content_asset_id = Some(asset.id.clone());
            new_assets.push(asset);
          }
          StagedAsset::QuotaExceeded => {}
        }
      }
    }

    let superseded = self
      .bookmark_repository
      .finalize_crawl(
        &bookmark.id,
        CrawlFinalization {
          html_content,
          content_asset_id,
          new_assets,
        },
      )
      .await?;
    Ok(superseded)
  }

  async fn stage_optional(
    &self,
    bookmark: &Bookmark,
    role: AssetRole,
    content_type: &str,
    bytes: Option<&[u8]>,
  ) -> Option<NewAsset> {
    let bytes = bytes?;
    match self
      .asset_manager
      .stage(&bookmark.user_id, role, content_type, None, None, bytes)
      .await
    {
      Ok(StagedAsset::Stored(asset)) => Some(asset),
      Ok(StagedAsset::QuotaExceeded) => None,
      Err(e) => {
        warn!(
          role = role.to_string(),
          message = e.to_string(),
          "Failed to store capture, continuing without it"
        );
        None
      }
    }
  }

  async fn download_banner(
    &self,
    bookmark: &Bookmark,
    metadata: &PageMetadata,
    cancellation: &CancellationToken,
  ) -> Option<NewAsset> {
    if !self.settings.crawler.download_banner_image {
      return None;
    }
    let image_url = metadata.image.as_deref()?;
    let url = Url::parse(image_url).ok()?;
    if self.url_policy.validate(&url).is_err() {
      warn!(image_url, "Banner image blocked by url policy");
      return None;
    }

    let response = tokio::select! {
      response = timeout(BANNER_DOWNLOAD_TIMEOUT, self.client.get(url.clone()).send()) => {
        response.ok()?.ok()?
      }
      _ = cancellation.cancelled() => return None,
    };
    if !response.status().is_success() {
      return None;
    }
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|value| value.to_str().ok())
      .map(|value| value.split(';').next().unwrap_or("image/jpeg").to_string())
      .unwrap_or_else(|| "image/jpeg".to_string());
    let bytes = self
      .read_bounded_body(response, cancellation)
      .await
      .ok()
      .flatten()?;

    match self
      .asset_manager
      .stage(
        &bookmark.user_id,
        AssetRole::BannerImage,
        &content_type,
        None,
        Some(url.to_string()),
        &bytes,
      )
      .await
    {
      Ok(StagedAsset::Stored(asset)) => Some(asset),
      _ => None,
    }
  }

  async fn enqueue_asset_deletions(
    &self,
    bookmark: &Bookmark,
    superseded: Vec<BookmarkAsset>,
  ) -> Result<()> {
    let queue = JobQueue::<crate::assets::asset_jobs::AssetDeletionJobPayload>::new(
      Arc::clone(&self.queue_repository),
      QueueName::AssetDeletion,
    );
    for asset in superseded {
      queue
        .enqueue(
          &crate::assets::asset_jobs::AssetDeletionJobPayload {
            user_id: bookmark.user_id.clone(),
            asset_id: asset.id,
            size_bytes: asset.size_bytes,
          },
          Default::default(),
        )
        .await?;
    }
    Ok(())
  }

  async fn enqueue_followups(
    &self,
    bookmark: &Bookmark,
    payload: &CrawlJobPayload,
    url: &str,
    job: &Job,
  ) -> Result<()> {
    if payload.run_inference.unwrap_or(true) {
      self
        .bookmark_interactor
        .request_enrichment(bookmark, job.priority)
        .await?;
    }
    self
      .bookmark_interactor
      .enqueue_search_upsert(bookmark, job.priority)
      .await?;

    if self.settings.crawler.download_video {
      let queue = JobQueue::<crate::enrichment::video_jobs::VideoJobPayload>::new(
        Arc::clone(&self.queue_repository),
        QueueName::Video,
      );
      queue
        .enqueue(
          &crate::enrichment::video_jobs::VideoJobPayload {
            bookmark_id: bookmark.id.clone(),
            url: url.to_string(),
          },
          EnqueueParametersBuilder::default()
            .priority(job.priority)
            .group_id(bookmark.user_id.clone())
            .build()?,
        )
        .await?;
    }

    self
      .bookmark_interactor
      .notify(
        bookmark,
        WebhookEvent::Crawled,
        RuleEvent::BookmarkAdded,
        job.priority,
      )
      .await?;
    Ok(())
  }

  /// Last step, after both persistence phases: feed the captured HTML to the
  /// external archiver and swap the full-page archive asset. Failures only
  /// cost the archive.
  async fn archive_page(
    &self,
    bookmark: &Bookmark,
    html: &str,
    url: &str,
    cancellation: &CancellationToken,
  ) {
    let archived = match self.archiver.archive(html, url, cancellation).await {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(message = e.to_string(), "Full-page archive failed");
        return;
      }
    };
    let staged = self
      .asset_manager
      .stage(
        &bookmark.user_id,
        AssetRole::FullPageArchive,
        "text/html",
        None,
        Some(url.to_string()),
        &archived,
      )
      .await;
    let asset = match staged {
      Ok(StagedAsset::Stored(asset)) => asset,
      Ok(StagedAsset::QuotaExceeded) => return,
      Err(e) => {
        warn!(message = e.to_string(), "Failed to store full-page archive");
        return;
      }
    };
    match self
      .bookmark_repository
      .replace_asset(&bookmark.id, asset)
      .await
    {
      Ok(superseded) => {
        if let Err(e) = self.enqueue_asset_deletions(bookmark, superseded).await {
          warn!(message = e.to_string(), "Failed to enqueue archive deletions");
        }
      }
      Err(e) => {
        warn!(message = e.to_string(), "Failed to attach full-page archive");
      }
    }
  }
}

fn parse_metadata_date(raw: Option<&str>) -> Option<NaiveDateTime> {
  let raw = raw?.trim();
  if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
    return Some(parsed.naive_utc());
  }
  if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
    return Some(parsed);
  }
  chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
    .ok()
    .and_then(|date| date.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retryable_status_set() {
    for status in [403u16, 429, 500, 502, 503, 504] {
      assert!(is_retryable_status(status), "{status} must retry");
    }
    for status in [200u16, 201, 301, 302, 304, 400, 404, 410] {
      assert!(!is_retryable_status(status), "{status} must not retry");
    }
  }

  #[test]
  fn test_html_inline_threshold_boundary() {
    assert!(stores_html_inline(51199, 51200));
    assert!(!stores_html_inline(51200, 51200), "exactly-at-threshold goes to the blob store");
    assert!(!stores_html_inline(51201, 51200));
  }

  #[test]
  fn test_metadata_date_parsing() {
    assert_eq!(
      parse_metadata_date(Some("2024-03-01T10:00:00Z")),
      Some(
        chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
          .unwrap()
          .and_hms_opt(10, 0, 0)
          .unwrap()
      )
    );
    assert_eq!(
      parse_metadata_date(Some("2024-03-01")),
      Some(
        chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
          .unwrap()
          .and_hms_opt(0, 0, 0)
          .unwrap()
      )
    );
    assert_eq!(parse_metadata_date(Some("next tuesday")), None);
    assert_eq!(parse_metadata_date(None), None);
  }
}
