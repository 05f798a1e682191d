use crate::settings::Settings;
use anyhow::{anyhow, Context, Result};
use std::{process::Stdio, sync::Arc, time::Duration};
use tokio::{io::AsyncWriteExt, process::Command, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs the external single-file archiver over the HTML the browser already
/// captured, producing a self-contained page snapshot.
pub struct Archiver {
  settings: Arc<Settings>,
}

impl Archiver {
  pub fn new(settings: Arc<Settings>) -> Self {
    Self { settings }
  }

  #[instrument(skip(self, html), fields(html_bytes = html.len()))]
  pub async fn archive(
    &self,
    html: &str,
    url: &str,
    cancellation: &CancellationToken,
  ) -> Result<Vec<u8>> {
    let binary = self
      .settings
      .crawler
      .archiver_path
      .clone()
      .unwrap_or_else(|| "monolith".to_string());

    let mut command = Command::new(&binary);
    command
      .arg("-")
      .arg("-b")
      .arg(url)
      .arg("-o")
      .arg("-")
      .arg("-s")
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .kill_on_drop(true);
    if let Some(proxy) = self.settings.proxy.pick_http_proxy() {
      command.env("http_proxy", proxy);
    }
    if let Some(proxy) = self.settings.proxy.pick_https_proxy() {
      command.env("https_proxy", proxy);
    }
    if let Some(no_proxy) = &self.settings.proxy.no_proxy {
      command.env("no_proxy", no_proxy);
    }

    let mut child = command
      .spawn()
      .with_context(|| format!("Failed to spawn archiver '{}'", binary))?;
    let mut stdin = child
      .stdin
      .take()
      .ok_or_else(|| anyhow!("Archiver stdin unavailable"))?;
    stdin.write_all(html.as_bytes()).await?;
    drop(stdin);

    let output = tokio::select! {
      output = timeout(ARCHIVE_TIMEOUT, child.wait_with_output()) => {
        output.map_err(|_| anyhow!("Archiver timed out"))??
      }
      _ = cancellation.cancelled() => {
        return Err(anyhow!("Archiver cancelled"));
      }
    };

    if !output.status.success() {
      return Err(anyhow!("Archiver exited with {}", output.status));
    }
    info!(bytes = output.stdout.len(), "Archived page");
    Ok(output.stdout)
  }
}
