use anyhow::{Context, Result};
use std::{
  collections::HashSet,
  net::{IpAddr, Ipv4Addr, Ipv6Addr},
  path::Path,
};
use thiserror::Error;
use tracing::info;
use url::{Host, Url};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyViolation {
  #[error("scheme '{0}' is not allowed")]
  DisallowedScheme(String),
  #[error("url has no host")]
  MissingHost,
  #[error("address {0} is not publicly routable")]
  PrivateAddress(String),
  #[error("host {0} is on the blocklist")]
  BlockedHost(String),
}

/// Allow-list applied to the navigation target and, via the request
/// interceptor, to every sub-request the page makes.
#[derive(Debug, Default)]
pub struct UrlPolicy {
  blocked_hosts: HashSet<String>,
}

impl UrlPolicy {
  pub fn new() -> Self {
    Self::default()
  }

  /// Hosts-file style blocklist, one host per line, `#` comments. Lines in
  /// `0.0.0.0 host` form keep only the host column.
  pub fn with_blocklist_file(path: impl AsRef<Path>) -> Result<Self> {
    let contents = std::fs::read_to_string(path.as_ref())
      .with_context(|| format!("Failed to read blocklist {}", path.as_ref().display()))?;
    let mut blocked_hosts = HashSet::new();
    for line in contents.lines() {
      let line = line.split('#').next().unwrap_or_default().trim();
      if line.is_empty() {
        continue;
      }
      let host = line.split_whitespace().last().unwrap_or_default();
      if !host.is_empty() && host != "0.0.0.0" && host != "localhost" {
        blocked_hosts.insert(host.to_ascii_lowercase());
      }
    }
    info!(hosts = blocked_hosts.len(), "Loaded blocklist");
    Ok(Self { blocked_hosts })
  }

  pub fn validate(&self, url: &Url) -> Result<(), PolicyViolation> {
    match url.scheme() {
      "http" | "https" => {}
      other => return Err(PolicyViolation::DisallowedScheme(other.to_string())),
    }

    let host = url.host().ok_or(PolicyViolation::MissingHost)?;
    match host {
      Host::Ipv4(addr) => {
        if !ipv4_is_public(&addr) {
          return Err(PolicyViolation::PrivateAddress(addr.to_string()));
        }
      }
      Host::Ipv6(addr) => {
        if !ipv6_is_public(&addr) {
          return Err(PolicyViolation::PrivateAddress(addr.to_string()));
        }
      }
      Host::Domain(domain) => {
        let domain = domain.to_ascii_lowercase();
        if domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local") {
          return Err(PolicyViolation::PrivateAddress(domain));
        }
        if self.is_blocked(&domain) {
          return Err(PolicyViolation::BlockedHost(domain));
        }
      }
    }
    Ok(())
  }

  pub fn validate_address(&self, addr: &IpAddr) -> Result<(), PolicyViolation> {
    let public = match addr {
      IpAddr::V4(v4) => ipv4_is_public(v4),
      IpAddr::V6(v6) => ipv6_is_public(v6),
    };
    if public {
      Ok(())
    } else {
      Err(PolicyViolation::PrivateAddress(addr.to_string()))
    }
  }

  fn is_blocked(&self, domain: &str) -> bool {
    if self.blocked_hosts.contains(domain) {
      return true;
    }
    // A blocklist entry covers its subdomains.
    domain
      .match_indices('.')
      .any(|(idx, _)| self.blocked_hosts.contains(&domain[idx + 1..]))
  }
}

fn ipv4_is_public(addr: &Ipv4Addr) -> bool {
  !(addr.is_private()
    || addr.is_loopback()
    || addr.is_link_local()
    || addr.is_unspecified()
    || addr.is_broadcast()
    || addr.is_documentation()
    // Carrier-grade NAT, 100.64.0.0/10.
    || (addr.octets()[0] == 100 && (addr.octets()[1] & 0xc0) == 64))
}

fn ipv6_is_public(addr: &Ipv6Addr) -> bool {
  if addr.is_loopback() || addr.is_unspecified() {
    return false;
  }
  let segments = addr.segments();
  // Unique-local fc00::/7 and link-local fe80::/10.
  if (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80 {
    return false;
  }
  if let Some(mapped) = addr.to_ipv4_mapped() {
    return ipv4_is_public(&mapped);
  }
  true
}

#[cfg(test)]
mod tests {
  use super::*;

  fn check(policy: &UrlPolicy, url: &str) -> Result<(), PolicyViolation> {
    policy.validate(&Url::parse(url).unwrap())
  }

  #[test]
  fn test_schemes() {
    let policy = UrlPolicy::new();
    assert!(check(&policy, "https://example.com").is_ok());
    assert!(check(&policy, "http://example.com").is_ok());
    assert_eq!(
      check(&policy, "file:///etc/passwd"),
      Err(PolicyViolation::DisallowedScheme("file".to_string()))
    );
    assert!(matches!(
      check(&policy, "ftp://example.com"),
      Err(PolicyViolation::DisallowedScheme(_))
    ));
  }

  #[test]
  fn test_private_ranges_are_rejected() {
    let policy = UrlPolicy::new();
    for url in [
      "http://127.0.0.1/admin",
      "http://10.1.2.3/",
      "http://192.168.1.1/",
      "http://172.16.0.10/",
      "http://169.254.169.254/latest/meta-data",
      "http://100.64.3.4/",
      "http://0.0.0.0/",
      "http://localhost:8080/",
      "http://internal.localhost/",
      "http://[::1]/",
      "http://[fe80::1]/",
      "http://[fd00::1]/",
      "http://[::ffff:192.168.0.1]/",
    ] {
      assert!(
        matches!(check(&policy, url), Err(PolicyViolation::PrivateAddress(_))),
        "{url} must be rejected"
      );
    }
    assert!(check(&policy, "http://8.8.8.8/").is_ok());
  }

  #[test]
  fn test_blocklist_covers_subdomains() {
    let policy = UrlPolicy {
      blocked_hosts: ["ads.example".to_string()].into_iter().collect(),
    };
    assert_eq!(
      check(&policy, "https://ads.example/banner.js"),
      Err(PolicyViolation::BlockedHost("ads.example".to_string()))
    );
    assert!(matches!(
      check(&policy, "https://cdn.ads.example/banner.js"),
      Err(PolicyViolation::BlockedHost(_))
    ));
    assert!(check(&policy, "https://example.com/").is_ok());
    assert!(check(&policy, "https://notads.example.com/").is_ok());
  }

  #[test]
  fn test_blocklist_file_parsing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("hosts.txt");
    std::fs::write(
      &path,
      "# comment\n0.0.0.0 tracker.example\nads.example # inline\n\nlocalhost\n",
    )?;
    let policy = UrlPolicy::with_blocklist_file(&path)?;
    assert!(policy.is_blocked("tracker.example"));
    assert!(policy.is_blocked("ads.example"));
    assert!(!policy.is_blocked("localhost"), "localhost line is ignored");
    Ok(())
  }
}
