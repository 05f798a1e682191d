use super::extract::ExtractedPage;
use crate::settings::Settings;
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::{process::Stdio, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub const PARSER_BINARY: &str = "magpie-parser";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserRequest {
  pub html_content: String,
  pub url: String,
  pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserFailureOutput {
  pub error: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stack: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ParserOutput {
  Success(ExtractedPage),
  Failure(ParserFailureOutput),
}

/// Readable-content extraction over arbitrary HTML is an OOM hazard; these
/// are the ways the child can come back dead or useless.
#[derive(Debug, Error)]
pub enum ParserError {
  #[error("parser ran out of memory")]
  OutOfMemory,
  #[error("parser timed out")]
  Timeout,
  #[error("parser failed: {0}")]
  Failed(String),
  #[error("parser produced invalid output: {0}")]
  InvalidOutput(String),
  #[error(transparent)]
  Io(#[from] anyhow::Error),
}

/// Spawns the extraction child with a bounded heap and a time budget, talks
/// JSON over stdin/stdout, and classifies how the child died.
pub struct ParserBridge {
  settings: Arc<Settings>,
}

impl ParserBridge {
  pub fn new(settings: Arc<Settings>) -> Self {
    Self { settings }
  }

  fn parser_binary() -> String {
    std::env::current_exe()
      .ok()
      .and_then(|exe| exe.parent().map(|dir| dir.join(PARSER_BINARY)))
      .filter(|path| path.exists())
      .map(|path| path.to_string_lossy().to_string())
      .unwrap_or_else(|| PARSER_BINARY.to_string())
  }

  #[instrument(skip(self, html_content), fields(html_bytes = html_content.len(), job_id))]
  pub async fn parse(
    &self,
    html_content: String,
    url: String,
    job_id: String,
    cancellation: &CancellationToken,
  ) -> Result<ExtractedPage, ParserError> {
    let binary = Self::parser_binary();
    let mut child = Command::new(&binary)
      .arg("--mem-limit-mb")
      .arg(self.settings.crawler.parser_mem_limit_mb.to_string())
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .kill_on_drop(true)
      .spawn()
      .with_context(|| format!("Failed to spawn parser '{}'", binary))?;

    let request = serde_json::to_vec(&ParserRequest {
      html_content,
      url,
      job_id: job_id.clone(),
    })
    .map_err(|e| ParserError::Io(e.into()))?;
    let mut stdin = child
      .stdin
      .take()
      .ok_or_else(|| anyhow!("Parser stdin unavailable"))?;
    stdin
      .write_all(&request)
      .await
      .context("Failed to write parser request")?;
    drop(stdin);

    let parse_timeout = Duration::from_secs(self.settings.crawler.parse_timeout_seconds);
    let output = tokio::select! {
      output = timeout(parse_timeout, child.wait_with_output()) => match output {
        Ok(output) => output.context("Failed to read parser output")?,
        Err(_) => {
          warn!(job_id = job_id.as_str(), "Parser timed out");
          return Err(ParserError::Timeout);
        }
      },
      _ = cancellation.cancelled() => {
        return Err(ParserError::Timeout);
      }
    };

    if !output.status.success() {
      return Err(classify_exit(
        output.status.code(),
        exit_signal(&output.status),
      ));
    }

    match serde_json::from_slice::<ParserOutput>(&output.stdout) {
      Ok(ParserOutput::Success(page)) => {
        info!(job_id = job_id.as_str(), "Parser finished");
        Ok(page)
      }
      Ok(ParserOutput::Failure(failure)) => Err(ParserError::Failed(failure.error)),
      Err(e) => Err(ParserError::InvalidOutput(e.to_string())),
    }
  }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
  std::os::unix::process::ExitStatusExt::signal(status)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
  None
}

/// Exit 137, SIGKILL and SIGABRT are how a capped heap dies; everything else
/// non-zero is a generic parser failure.
fn classify_exit(code: Option<i32>, signal: Option<i32>) -> ParserError {
  match (code, signal) {
    (Some(137), _) => ParserError::OutOfMemory,
    (_, Some(signal)) if signal == libc::SIGKILL || signal == libc::SIGABRT => {
      ParserError::OutOfMemory
    }
    (code, signal) => ParserError::Failed(format!(
      "parser exited with code {:?}, signal {:?}",
      code, signal
    )),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exit_classification() {
    assert!(matches!(classify_exit(Some(137), None), ParserError::OutOfMemory));
    assert!(matches!(
      classify_exit(None, Some(libc::SIGKILL)),
      ParserError::OutOfMemory
    ));
    assert!(matches!(
      classify_exit(None, Some(libc::SIGABRT)),
      ParserError::OutOfMemory
    ));
    assert!(matches!(classify_exit(Some(1), None), ParserError::Failed(_)));
    assert!(matches!(
      classify_exit(None, Some(libc::SIGTERM)),
      ParserError::Failed(_)
    ));
  }

  #[test]
  fn test_output_deserialization_shapes() {
    let success: ParserOutput = serde_json::from_str(
      r#"{"metadata": {"title": "T"}, "readable_content": {"content": "<p>x</p>"}}"#,
    )
    .unwrap();
    assert!(matches!(success, ParserOutput::Success(_)));

    let null_content: ParserOutput =
      serde_json::from_str(r#"{"metadata": {}, "readable_content": null}"#).unwrap();
    match null_content {
      ParserOutput::Success(page) => assert!(page.readable_content.is_none()),
      ParserOutput::Failure(_) => panic!("expected success shape"),
    }

    let failure: ParserOutput =
      serde_json::from_str(r#"{"error": "boom", "stack": "at main"}"#).unwrap();
    assert!(matches!(failure, ParserOutput::Failure(_)));
  }
}
