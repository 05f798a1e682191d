#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct SqliteSettings {
  pub dir: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct TracingSettings {
  pub otel_collector_endpoint: String,
  pub service_name: String,
  pub host_name: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct DomainRateLimitSettings {
  pub max_requests: u32,
  pub window_ms: u64,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct BrowserSettings {
  pub web_socket_url: Option<String>,
  pub web_url: Option<String>,
  pub connect_on_demand: bool,
  pub executable_path: Option<String>,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct CrawlerSettings {
  pub num_workers: u32,
  pub job_timeout_seconds: u64,
  pub navigate_timeout_seconds: u64,
  pub screenshot_timeout_seconds: u64,
  pub parse_timeout_seconds: u64,
  pub parser_mem_limit_mb: u64,
  pub store_screenshot: bool,
  pub store_pdf: bool,
  pub full_page_screenshot: bool,
  pub full_page_archive: bool,
  pub download_banner_image: bool,
  pub download_video: bool,
  pub html_content_size_threshold: u64,
  pub browser: BrowserSettings,
  pub enable_adblocker: bool,
  pub blocklist_path: Option<String>,
  pub browser_cookie_path: Option<String>,
  pub archiver_path: Option<String>,
  pub domain_ratelimiting: DomainRateLimitSettings,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct ProxySettings {
  pub http_proxy: Option<String>,
  pub https_proxy: Option<String>,
  pub no_proxy: Option<String>,
}

impl ProxySettings {
  /// Proxy lists are comma-separated; a random entry is picked per call.
  pub fn pick_http_proxy(&self) -> Option<String> {
    Self::pick(self.http_proxy.as_deref())
  }

  pub fn pick_https_proxy(&self) -> Option<String> {
    Self::pick(self.https_proxy.as_deref())
  }

  fn pick(list: Option<&str>) -> Option<String> {
    use rand::seq::IndexedRandom;
    let entries = list?
      .split(',')
      .map(str::trim)
      .filter(|entry| !entry.is_empty())
      .collect::<Vec<_>>();
    entries.choose(&mut rand::rng()).map(|s| s.to_string())
  }
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct ImportSettings {
  pub batch_size: u32,
  pub max_in_flight: u32,
  pub poll_interval_seconds: u64,
  pub stale_threshold_seconds: u64,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct SearchSettings {
  pub url: String,
  pub index_name: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct InferenceSettings {
  pub api_base: Option<String>,
  pub api_key: String,
  pub text_model: String,
  pub context_length: u64,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct ContentStoreSettings {
  pub region: String,
  pub endpoint: String,
  pub bucket: String,
  pub key: String,
  pub secret: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct Settings {
  pub sqlite: SqliteSettings,
  pub tracing: TracingSettings,
  pub crawler: CrawlerSettings,
  #[serde(default)]
  pub proxy: ProxySettings,
  pub import: ImportSettings,
  pub search: SearchSettings,
  #[serde(default)]
  pub inference: InferenceSettings,
  #[serde(default)]
  pub content_store: ContentStoreSettings,
  pub max_asset_size_mb: u64,
}

impl Settings {
  pub fn new() -> Result<Self, config::ConfigError> {
    let s = config::Config::builder()
      .add_source(config::Environment::default().separator("__"))
      .set_default("sqlite.dir", "./data")?
      .set_default("tracing.otel_collector_endpoint", "http://localhost:4317")?
      .set_default("tracing.service_name", "magpie")?
      .set_default("tracing.host_name", "localhost")?
      .set_default("crawler.num_workers", 4)?
      .set_default("crawler.job_timeout_seconds", 120)?
      .set_default("crawler.navigate_timeout_seconds", 30)?
      .set_default("crawler.screenshot_timeout_seconds", 10)?
      .set_default("crawler.parse_timeout_seconds", 30)?
      .set_default("crawler.parser_mem_limit_mb", 512)?
      .set_default("crawler.store_screenshot", true)?
      .set_default("crawler.store_pdf", false)?
      .set_default("crawler.full_page_screenshot", false)?
      .set_default("crawler.full_page_archive", false)?
      .set_default("crawler.download_banner_image", true)?
      .set_default("crawler.download_video", false)?
      .set_default("crawler.html_content_size_threshold", 51200)?
      .set_default("crawler.browser.connect_on_demand", false)?
      .set_default("crawler.enable_adblocker", false)?
      .set_default("crawler.domain_ratelimiting.max_requests", 30)?
      .set_default("crawler.domain_ratelimiting.window_ms", 60000)?
      .set_default("import.batch_size", 20)?
      .set_default("import.max_in_flight", 50)?
      .set_default("import.poll_interval_seconds", 1)?
      .set_default("import.stale_threshold_seconds", 1800)?
      .set_default("search.url", "http://localhost:9200")?
      .set_default("search.index_name", "bookmarks")?
      .set_default("inference.api_key", "")?
      .set_default("inference.text_model", "gpt-4o-mini")?
      .set_default("inference.context_length", 8192)?
      .set_default("content_store.region", "us-east-1")?
      .set_default("content_store.endpoint", "http://localhost:9000")?
      .set_default("content_store.bucket", "magpie-assets")?
      .set_default("content_store.key", "")?
      .set_default("content_store.secret", "")?
      .set_default("max_asset_size_mb", 50)?
      .build()?;

    Ok(s.try_deserialize()?)
  }

  pub fn max_asset_size_bytes(&self) -> u64 {
    self.max_asset_size_mb * 1024 * 1024
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_proxy_pick_from_list() {
    let settings = ProxySettings {
      http_proxy: Some("http://one:8080, http://two:8080".to_string()),
      https_proxy: None,
      no_proxy: None,
    };
    for _ in 0..10 {
      let picked = settings.pick_http_proxy().unwrap();
      assert!(picked == "http://one:8080" || picked == "http://two:8080");
    }
    assert_eq!(settings.pick_https_proxy(), None);
  }

  #[test]
  fn test_proxy_pick_empty_list() {
    let settings = ProxySettings {
      http_proxy: Some(" , ".to_string()),
      https_proxy: None,
      no_proxy: None,
    };
    assert_eq!(settings.pick_http_proxy(), None);
  }
}
