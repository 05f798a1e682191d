use crate::{
  assets::{asset_manager::AssetManager, asset_store::AssetStore},
  bookmarks::{bookmark_interactor::BookmarkInteractor, bookmark_repository::BookmarkRepository},
  crawler::{browser::BrowserHandle, crawler::Crawler, rate_limiter::DomainRateLimiter},
  enrichment::llm::InferenceClient,
  helpers::key_value_store::KeyValueStore,
  hooks::{rule_engine::RuleRepository, webhook_jobs::WebhookRepository},
  import::import_repository::ImportRepository,
  metrics::AppMetrics,
  queue::queue_repository::QueueRepository,
  search::{
    batch_writer::BatchingIndexWriter,
    search_index::{ElasticsearchSearchIndex, SearchIndex},
  },
  settings::Settings,
  sqlite::SqliteConnection,
};
use anyhow::Result;
use dotenv::dotenv;
use elasticsearch::{http::transport::Transport, Elasticsearch};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ApplicationContext {
  pub settings: Arc<Settings>,
  pub sqlite_connection: Arc<SqliteConnection>,
  pub kv: Arc<KeyValueStore>,
  pub metrics: AppMetrics,
  pub shutdown: CancellationToken,
  pub queue_repository: Arc<QueueRepository>,
  pub bookmark_repository: Arc<BookmarkRepository>,
  pub bookmark_interactor: Arc<BookmarkInteractor>,
  pub asset_manager: Arc<AssetManager>,
  pub import_repository: Arc<ImportRepository>,
  pub webhook_repository: Arc<WebhookRepository>,
  pub rule_repository: Arc<RuleRepository>,
  pub browser: Arc<BrowserHandle>,
  pub crawler: Arc<Crawler>,
  pub inference_client: Arc<InferenceClient>,
  pub elasticsearch_client: Arc<Elasticsearch>,
  pub index_writer: BatchingIndexWriter,
  pub http_client: reqwest::Client,
}

impl ApplicationContext {
  pub async fn init() -> Result<Arc<ApplicationContext>> {
    dotenv().ok();
    let settings = Arc::new(Settings::new()?);
    Self::init_with(settings).await
  }

  pub async fn init_with(settings: Arc<Settings>) -> Result<Arc<ApplicationContext>> {
    let shutdown = CancellationToken::new();
    let sqlite_connection = Arc::new(SqliteConnection::new(Arc::clone(&settings)).await?);
    let kv = Arc::new(KeyValueStore::new(Arc::clone(&sqlite_connection)));
    let metrics = AppMetrics::new();

    let queue_repository = Arc::new(QueueRepository::new(Arc::clone(&sqlite_connection)));
    let bookmark_repository = Arc::new(BookmarkRepository::new(Arc::clone(&sqlite_connection)));
    let bookmark_interactor = Arc::new(BookmarkInteractor::new(
      Arc::clone(&bookmark_repository),
      Arc::clone(&queue_repository),
    ));
    let asset_store = Arc::new(AssetStore::new(&settings.content_store)?);
    let asset_manager = Arc::new(AssetManager::new(
      asset_store,
      Arc::clone(&bookmark_repository),
    ));
    let import_repository = Arc::new(ImportRepository::new(Arc::clone(&sqlite_connection)));
    let webhook_repository = Arc::new(WebhookRepository::new(Arc::clone(&sqlite_connection)));
    let rule_repository = Arc::new(RuleRepository::new(Arc::clone(&sqlite_connection)));

    let browser = Arc::new(BrowserHandle::new(
      Arc::clone(&settings),
      shutdown.clone(),
    )?);
    let rate_limiter = Arc::new(DomainRateLimiter::new(Arc::clone(&kv)));
    let crawler = Arc::new(Crawler::new(
      Arc::clone(&settings),
      Arc::clone(&browser),
      rate_limiter,
      Arc::clone(&bookmark_repository),
      Arc::clone(&bookmark_interactor),
      Arc::clone(&asset_manager),
      Arc::clone(&queue_repository),
      metrics.clone(),
    )?);

    let inference_client = Arc::new(InferenceClient::new(Arc::clone(&settings)));
    let elasticsearch_client = Arc::new(Elasticsearch::new(Transport::single_node(
      &settings.search.url,
    )?));
    let search_index = Arc::new(ElasticsearchSearchIndex::new(
      Arc::clone(&elasticsearch_client),
      settings.search.index_name.clone(),
    ));
    let index_writer = BatchingIndexWriter::new(search_index as Arc<dyn SearchIndex>);
    let http_client = reqwest::Client::new();

    Ok(Arc::new(ApplicationContext {
      settings,
      sqlite_connection,
      kv,
      metrics,
      shutdown,
      queue_repository,
      bookmark_repository,
      bookmark_interactor,
      asset_manager,
      import_repository,
      webhook_repository,
      rule_repository,
      browser,
      crawler,
      inference_client,
      elasticsearch_client,
      index_writer,
      http_client,
    }))
  }

  #[cfg(test)]
  pub async fn test_instance() -> Result<(Arc<ApplicationContext>, tempfile::TempDir)> {
    let dir = tempfile::TempDir::new()?;
    let mut settings = Settings::default();
    settings.sqlite.dir = dir.path().to_string_lossy().to_string();
    settings.crawler.num_workers = 1;
    settings.crawler.job_timeout_seconds = 30;
    settings.crawler.navigate_timeout_seconds = 5;
    settings.crawler.screenshot_timeout_seconds = 5;
    settings.crawler.parse_timeout_seconds = 5;
    settings.crawler.parser_mem_limit_mb = 128;
    settings.crawler.html_content_size_threshold = 1024;
    settings.crawler.domain_ratelimiting.max_requests = 100;
    settings.crawler.domain_ratelimiting.window_ms = 60_000;
    settings.import.batch_size = 3;
    settings.import.max_in_flight = 4;
    settings.import.poll_interval_seconds = 1;
    settings.import.stale_threshold_seconds = 1800;
    settings.search.url = "http://localhost:9200".to_string();
    settings.search.index_name = "bookmarks-test".to_string();
    settings.content_store.endpoint = "http://localhost:9000".to_string();
    settings.content_store.region = "us-east-1".to_string();
    settings.content_store.bucket = "magpie-test".to_string();
    settings.inference.text_model = "gpt-4o-mini".to_string();
    settings.inference.context_length = 2048;
    settings.max_asset_size_mb = 5;

    let context = Self::init_with(Arc::new(settings)).await?;
    Ok((context, dir))
  }
}
