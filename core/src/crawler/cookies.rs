use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// One cookie from the operator-provided cookie file, injected into every
/// browser context.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BrowserCookie {
  pub name: String,
  pub value: String,
  pub domain: Option<String>,
  pub path: Option<String>,
  pub expires: Option<f64>,
  pub http_only: Option<bool>,
  pub secure: Option<bool>,
  pub same_site: Option<String>,
}

const SAME_SITE_VALUES: [&str; 3] = ["Strict", "Lax", "None"];

/// An invalid cookie file is a configuration error and aborts crawler
/// initialization rather than silently crawling without the cookies.
pub fn load_cookie_file(path: impl AsRef<Path>) -> Result<Vec<BrowserCookie>> {
  let path = path.as_ref();
  let contents = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read cookie file {}", path.display()))?;
  let cookies: Vec<BrowserCookie> = serde_json::from_str(&contents)
    .with_context(|| format!("Cookie file {} is not a valid cookie array", path.display()))?;

  for cookie in &cookies {
    if cookie.name.is_empty() {
      bail!("Cookie file {} contains a cookie without a name", path.display());
    }
    if let Some(same_site) = &cookie.same_site {
      if !SAME_SITE_VALUES.contains(&same_site.as_str()) {
        bail!(
          "Cookie '{}' has invalid same_site value '{}'",
          cookie.name,
          same_site
        );
      }
    }
  }
  info!(count = cookies.len(), "Loaded browser cookies");
  Ok(cookies)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_file(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cookies.json");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
  }

  #[test]
  fn test_valid_cookie_file() -> Result<()> {
    let (_dir, path) = write_file(
      r#"[
        {"name": "session", "value": "abc", "domain": ".example.com", "same_site": "Lax"},
        {"name": "theme", "value": "dark", "secure": true, "http_only": false}
      ]"#,
    );
    let cookies = load_cookie_file(&path)?;
    assert_eq!(cookies.len(), 2);
    assert_eq!(cookies[0].name, "session");
    assert_eq!(cookies[0].domain.as_deref(), Some(".example.com"));
    Ok(())
  }

  #[test]
  fn test_invalid_same_site_aborts() {
    let (_dir, path) = write_file(r#"[{"name": "a", "value": "b", "same_site": "sometimes"}]"#);
    assert!(load_cookie_file(&path).is_err());
  }

  #[test]
  fn test_malformed_json_aborts() {
    let (_dir, path) = write_file("{not json");
    assert!(load_cookie_file(&path).is_err());
  }
}
