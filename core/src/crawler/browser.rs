use super::{cookies::BrowserCookie, url_policy::UrlPolicy};
use crate::settings::Settings;
use anyhow::{anyhow, Context, Result};
use chromiumoxide::{
  browser::{Browser, BrowserConfig},
  cdp::browser_protocol::{
    browser::BrowserContextId,
    fetch::{ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused, FailRequestParams},
    network::{CookieParam, CookieSameSite, ErrorReason, ResourceType},
    page::{EventJavascriptDialogOpening, HandleJavaScriptDialogParams},
    target::{CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams},
  },
  Page,
};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use std::{
  collections::HashMap,
  sync::Arc,
  time::{Duration, Instant},
};
use tokio::{spawn, sync::Mutex, task::JoinHandle, time::{sleep, timeout}};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use url::Url;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONTEXT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const REAPER_INTERVAL: Duration = Duration::from_secs(300);
const REAPER_SLACK: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrowserMode {
  Connected,
  OnDemand,
  Browserless,
}

struct SharedBrowser {
  browser: Arc<Browser>,
  handler_task: JoinHandle<()>,
}

enum ContextKind {
  /// An isolated context on the shared browser.
  Shared {
    browser: Arc<Browser>,
    context_id: BrowserContextId,
  },
  /// A browser launched for this job alone; dropping the last reference
  /// kills the child process.
  Dedicated {
    browser: Arc<Browser>,
    handler_task: JoinHandle<()>,
  },
}

pub struct AcquiredContext {
  pub page: Page,
  job_id: String,
  kind: ContextKind,
}

struct RegisteredContext {
  created_at: Instant,
  browser: Arc<Browser>,
  context_id: Option<BrowserContextId>,
}

/// Process-wide browser singleton. Only the (re)connect path is mutex
/// guarded; each job owns exactly one context, and the reaper owns contexts
/// whose job overstayed its timeout.
pub struct BrowserHandle {
  settings: Arc<Settings>,
  cookies: Vec<BrowserCookie>,
  shared: Mutex<Option<SharedBrowser>>,
  active_contexts: Mutex<HashMap<String, RegisteredContext>>,
  shutdown: CancellationToken,
}

impl BrowserHandle {
  /// Fails fast on an invalid cookie file; everything else is lazy.
  pub fn new(settings: Arc<Settings>, shutdown: CancellationToken) -> Result<Self> {
    let cookies = match &settings.crawler.browser_cookie_path {
      Some(path) => super::cookies::load_cookie_file(path)?,
      None => Vec::new(),
    };
    Ok(Self {
      settings,
      cookies,
      shared: Mutex::new(None),
      active_contexts: Mutex::new(HashMap::new()),
      shutdown,
    })
  }

  fn mode(&self) -> BrowserMode {
    let browser = &self.settings.crawler.browser;
    if browser.connect_on_demand {
      BrowserMode::OnDemand
    } else if browser.web_socket_url.is_some() || browser.web_url.is_some() {
      BrowserMode::Connected
    } else {
      BrowserMode::Browserless
    }
  }

  /// The debugger websocket endpoint, either configured directly or resolved
  /// through the browser's HTTP debug surface.
  async fn websocket_url(&self) -> Result<String> {
    let browser = &self.settings.crawler.browser;
    if let Some(ws_url) = &browser.web_socket_url {
      return Ok(ws_url.clone());
    }
    let web_url = browser
      .web_url
      .as_ref()
      .ok_or_else(|| anyhow!("No browser endpoint configured"))?;
    let version: serde_json::Value = reqwest::Client::new()
      .get(format!("{}/json/version", web_url.trim_end_matches('/')))
      .send()
      .await?
      .error_for_status()?
      .json()
      .await?;
    version["webSocketDebuggerUrl"]
      .as_str()
      .map(|url| url.to_string())
      .ok_or_else(|| anyhow!("Browser debug endpoint returned no websocket url"))
  }

  /// Returns None in browserless mode and when the shared browser cannot be
  /// reached; the caller degrades to a plain HTTP fetch.
  #[instrument(skip(self))]
  pub async fn acquire(self: &Arc<Self>, job_id: &str) -> Result<Option<AcquiredContext>> {
    match self.mode() {
      BrowserMode::Browserless => Ok(None),
      BrowserMode::Connected => match self.acquire_shared(job_id).await {
        Ok(context) => Ok(Some(context)),
        Err(e) => {
          warn!(
            job_id,
            message = e.to_string(),
            "Shared browser unavailable, degrading to browserless crawl"
          );
          Ok(None)
        }
      },
      BrowserMode::OnDemand => match self.acquire_dedicated(job_id).await {
        Ok(context) => Ok(Some(context)),
        Err(e) => {
          warn!(
            job_id,
            message = e.to_string(),
            "Failed to launch browser, degrading to browserless crawl"
          );
          Ok(None)
        }
      },
    }
  }

  async fn acquire_shared(self: &Arc<Self>, job_id: &str) -> Result<AcquiredContext> {
    let browser = self.shared_browser().await?;
    let context_id = create_context(&browser).await?;
    let page = browser
      .new_page(
        CreateTargetParams::builder()
          .url("about:blank")
          .browser_context_id(context_id.clone())
          .build()
          .map_err(|e| anyhow!("Failed to build target params: {}", e))?,
      )
      .await?;
    self.prepare_page(&page).await?;
    self
      .register(job_id, Arc::clone(&browser), Some(context_id.clone()))
      .await;
    Ok(AcquiredContext {
      page,
      job_id: job_id.to_string(),
      kind: ContextKind::Shared {
        browser,
        context_id,
      },
    })
  }

  async fn acquire_dedicated(self: &Arc<Self>, job_id: &str) -> Result<AcquiredContext> {
    let mut config = BrowserConfig::builder();
    if let Some(path) = &self.settings.crawler.browser.executable_path {
      config = config.chrome_executable(path);
    }
    if let Some(proxy) = self.settings.proxy.pick_http_proxy() {
      config = config.arg(format!("--proxy-server={}", proxy));
    }
    let (browser, mut handler) = Browser::launch(
      config
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))?,
    )
    .await
    .context("Failed to launch browser")?;
    let handler_task = spawn(async move { while handler.next().await.is_some() {} });

    let browser = Arc::new(browser);
    let page = browser.new_page("about:blank").await?;
    self.prepare_page(&page).await?;
    self.register(job_id, Arc::clone(&browser), None).await;
    Ok(AcquiredContext {
      page,
      job_id: job_id.to_string(),
      kind: ContextKind::Dedicated {
        browser,
        handler_task,
      },
    })
  }

  /// One mutex serializes (re)connection so a disconnect storm produces a
  /// single reconnect.
  fn shared_browser(self: &Arc<Self>) -> BoxFuture<'_, Result<Arc<Browser>>> {
    async move {
    let mut shared = self.shared.lock().await;
    if let Some(existing) = shared.as_ref() {
      return Ok(Arc::clone(&existing.browser));
    }

    let ws_url = self.websocket_url().await?;
    let (browser, mut handler) = Browser::connect(ws_url.clone())
      .await
      .with_context(|| format!("Failed to connect to browser at {}", ws_url))?;
    info!(ws_url = ws_url.as_str(), "Connected to shared browser");

    let browser = Arc::new(browser);
    let watcher = Arc::downgrade(self);
    let handler_task = spawn(async move {
      while let Some(event) = handler.next().await {
        if event.is_err() {
          break;
        }
      }
      // Disconnected. Clear the slot and keep retrying on a fixed delay
      // unless the process is shutting down.
      let Some(handle) = watcher.upgrade() else {
        return;
      };
      if handle.shutdown.is_cancelled() {
        return;
      }
      warn!("Browser disconnected, reconnecting");
      handle.shared.lock().await.take();
      loop {
        sleep(RECONNECT_DELAY).await;
        if handle.shutdown.is_cancelled() {
          return;
        }
        // Boxed to break the type cycle between this watcher task and the
        // connect path that spawns it.
        let reconnect: BoxFuture<'_, Result<Arc<Browser>>> = handle.shared_browser();
        match reconnect.await {
          Ok(_) => {
            info!("Browser reconnected");
            return;
          }
          Err(e) => {
            warn!(message = e.to_string(), "Browser reconnect failed");
          }
        }
      }
    });

    *shared = Some(SharedBrowser {
      browser: Arc::clone(&browser),
      handler_task,
    });
    Ok(browser)
    }
    .boxed()
  }

  async fn prepare_page(&self, page: &Page) -> Result<()> {
    if !self.cookies.is_empty() {
      let params = self
        .cookies
        .iter()
        .map(to_cookie_param)
        .collect::<Result<Vec<_>>>()?;
      page.set_cookies(params).await?;
    }
    Ok(())
  }

  async fn register(
    &self,
    job_id: &str,
    browser: Arc<Browser>,
    context_id: Option<BrowserContextId>,
  ) {
    self.active_contexts.lock().await.insert(
      job_id.to_string(),
      RegisteredContext {
        created_at: Instant::now(),
        browser,
        context_id,
      },
    );
  }

  /// Close is always raced against a deadline. A context whose close hangs
  /// stays registered so the reaper retries instead of leaking the slot.
  pub async fn close_context(&self, context: AcquiredContext) {
    let job_id = context.job_id;
    match timeout(PAGE_CLOSE_TIMEOUT, context.page.close()).await {
      Ok(Ok(_)) => {}
      Ok(Err(e)) => {
        warn!(job_id = job_id.as_str(), message = e.to_string(), "Page close failed");
      }
      Err(_) => {
        warn!(job_id = job_id.as_str(), "Page close timed out");
      }
    }

    match context.kind {
      ContextKind::Shared {
        browser,
        context_id,
      } => {
        let disposed = timeout(CONTEXT_CLOSE_TIMEOUT, dispose_context(&browser, context_id)).await;
        match disposed {
          Ok(Ok(_)) => {
            self.active_contexts.lock().await.remove(&job_id);
          }
          Ok(Err(e)) => {
            warn!(
              job_id = job_id.as_str(),
              message = e.to_string(),
              "Context dispose failed, leaving slot for the reaper"
            );
          }
          Err(_) => {
            warn!(
              job_id = job_id.as_str(),
              "Context dispose timed out, leaving slot for the reaper"
            );
          }
        }
      }
      ContextKind::Dedicated {
        browser,
        handler_task,
      } => {
        handler_task.abort();
        drop(browser);
        self.active_contexts.lock().await.remove(&job_id);
      }
    }
  }

  /// Closes contexts whose owning job exceeded its deadline long ago.
  pub fn spawn_reaper(self: Arc<Self>) {
    let max_age =
      Duration::from_secs(self.settings.crawler.job_timeout_seconds) + REAPER_SLACK;
    spawn(async move {
      loop {
        tokio::select! {
          _ = sleep(REAPER_INTERVAL) => {}
          _ = self.shutdown.cancelled() => return,
        }

        let stale: Vec<(String, RegisteredContext)> = {
          let mut contexts = self.active_contexts.lock().await;
          let stale_ids = contexts
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() > max_age)
            .map(|(job_id, _)| job_id.clone())
            .collect::<Vec<_>>();
          stale_ids
            .into_iter()
            .filter_map(|job_id| contexts.remove_entry(&job_id))
            .collect()
        };

        for (job_id, entry) in stale {
          warn!(job_id = job_id.as_str(), "Reaping stale browser context");
          if let Some(context_id) = entry.context_id {
            let disposed =
              timeout(CONTEXT_CLOSE_TIMEOUT, dispose_context(&entry.browser, context_id)).await;
            if let Ok(Err(e)) = disposed {
              error!(
                job_id = job_id.as_str(),
                message = e.to_string(),
                "Failed to reap browser context"
              );
            }
          }
        }
      }
    });
  }

  pub async fn shutdown_shared(&self) {
    if let Some(shared) = self.shared.lock().await.take() {
      shared.handler_task.abort();
    }
  }
}

/// Isolated contexts go through the Target domain directly so shared-browser
/// jobs never see each other's cookies or cache.
async fn create_context(browser: &Browser) -> Result<BrowserContextId> {
  let response = browser
    .execute(CreateBrowserContextParams::default())
    .await?;
  Ok(response.result.browser_context_id.clone())
}

async fn dispose_context(browser: &Browser, context_id: BrowserContextId) -> Result<()> {
  browser
    .execute(DisposeBrowserContextParams::new(context_id))
    .await?;
  Ok(())
}

/// Per-page guards: abort audio/video sub-resources, re-validate every
/// sub-request against the URL policy, abort everything on cancellation,
/// and auto-dismiss JS dialogs.
pub async fn install_navigation_guards(
  page: &Page,
  policy: Arc<UrlPolicy>,
  cancellation: CancellationToken,
) -> Result<()> {
  page.execute(FetchEnableParams::default()).await?;

  let mut requests = page.event_listener::<EventRequestPaused>().await?;
  let intercept_page = page.clone();
  let intercept_cancellation = cancellation.clone();
  spawn(async move {
    loop {
      let event = tokio::select! {
        event = requests.next() => match event {
          Some(event) => event,
          None => return,
        },
        _ = intercept_cancellation.cancelled() => return,
      };

      let abort = intercept_cancellation.is_cancelled()
        || event.resource_type == ResourceType::Media
        || !request_is_allowed(&policy, &event.request.url);
      let request_id = event.request_id.clone();
      let outcome = if abort {
        intercept_page
          .execute(FailRequestParams::new(request_id, ErrorReason::Aborted))
          .await
          .map(|_| ())
      } else {
        intercept_page
          .execute(ContinueRequestParams::new(request_id))
          .await
          .map(|_| ())
      };
      if let Err(e) = outcome {
        warn!(message = e.to_string(), "Request interception failed");
        return;
      }
    }
  });

  let mut dialogs = page.event_listener::<EventJavascriptDialogOpening>().await?;
  let dialog_page = page.clone();
  spawn(async move {
    loop {
      let dialog = tokio::select! {
        dialog = dialogs.next() => dialog,
        _ = cancellation.cancelled() => return,
      };
      let Some(dialog) = dialog else { return };
      info!(message = dialog.message.as_str(), "Dismissing page dialog");
      if dialog_page
        .execute(HandleJavaScriptDialogParams::new(false))
        .await
        .is_err()
      {
        return;
      }
    }
  });

  Ok(())
}

fn request_is_allowed(policy: &UrlPolicy, raw_url: &str) -> bool {
  match Url::parse(raw_url) {
    Ok(url) => policy.validate(&url).is_ok(),
    // Anything unparseable (data:, about:, …) is left to the scheme check.
    Err(_) => false,
  }
}

fn to_cookie_param(cookie: &BrowserCookie) -> Result<CookieParam> {
  let mut builder = CookieParam::builder()
    .name(cookie.name.clone())
    .value(cookie.value.clone());
  if let Some(domain) = &cookie.domain {
    builder = builder.domain(domain.clone());
  }
  if let Some(path) = &cookie.path {
    builder = builder.path(path.clone());
  }
  if let Some(expires) = cookie.expires {
    builder = builder.expires(chromiumoxide::cdp::browser_protocol::network::TimeSinceEpoch::new(expires));
  }
  if let Some(http_only) = cookie.http_only {
    builder = builder.http_only(http_only);
  }
  if let Some(secure) = cookie.secure {
    builder = builder.secure(secure);
  }
  if let Some(same_site) = &cookie.same_site {
    builder = builder.same_site(match same_site.as_str() {
      "Strict" => CookieSameSite::Strict,
      "Lax" => CookieSameSite::Lax,
      _ => CookieSameSite::None,
    });
  }
  builder
    .build()
    .map_err(|e| anyhow!("Invalid cookie: {}", e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_policy_rejects_unparseable_and_private() {
    let policy = UrlPolicy::new();
    assert!(request_is_allowed(&policy, "https://example.com/app.js"));
    assert!(!request_is_allowed(&policy, "data:text/html,hi"));
    assert!(!request_is_allowed(&policy, "http://169.254.169.254/meta"));
    assert!(!request_is_allowed(&policy, "not a url"));
  }

  #[test]
  fn test_cookie_param_conversion() -> Result<()> {
    let param = to_cookie_param(&BrowserCookie {
      name: "session".to_string(),
      value: "abc".to_string(),
      domain: Some(".example.com".to_string()),
      path: Some("/".to_string()),
      expires: Some(1893456000.0),
      http_only: Some(true),
      secure: Some(true),
      same_site: Some("Strict".to_string()),
    })?;
    assert_eq!(param.name, "session");
    assert_eq!(param.domain.as_deref(), Some(".example.com"));
    Ok(())
  }
}
