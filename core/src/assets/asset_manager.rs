use super::asset_store::AssetStore;
use crate::bookmarks::{
  bookmark::{AssetRole, NewAsset},
  bookmark_repository::BookmarkRepository,
};
use anyhow::Result;
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_retry::{strategy::FibonacciBackoff, Retry};
use tracing::{instrument, warn};
use ulid::Ulid;

pub fn content_hash(bytes: &[u8]) -> String {
  HEXLOWER.encode(&Sha256::digest(bytes))
}

/// What a quota-checked store attempt produced. Quota misses are non-fatal:
/// the caller skips the asset and keeps going.
pub enum StagedAsset {
  Stored(NewAsset),
  QuotaExceeded,
}

/// Couples blob uploads to the per-user byte reservation: reserve in the
/// store transaction, upload, roll the reservation back if the upload fails.
pub struct AssetManager {
  store: Arc<AssetStore>,
  repository: Arc<BookmarkRepository>,
}

impl AssetManager {
  pub fn new(store: Arc<AssetStore>, repository: Arc<BookmarkRepository>) -> Self {
    Self { store, repository }
  }

  #[instrument(skip(self, bytes), fields(size = bytes.len()))]
  pub async fn stage(
    &self,
    user_id: &str,
    role: AssetRole,
    content_type: &str,
    file_name: Option<String>,
    source_url: Option<String>,
    bytes: &[u8],
  ) -> Result<StagedAsset> {
    let size_bytes = bytes.len() as u64;
    if !self.repository.reserve_storage(user_id, size_bytes).await? {
      warn!(user_id, role = role.to_string(), "Asset skipped, storage quota exceeded");
      return Ok(StagedAsset::QuotaExceeded);
    }

    let asset_id = Ulid::new().to_string();
    let upload = Retry::spawn(FibonacciBackoff::from_millis(500).take(3), || async {
      self.store.put(user_id, &asset_id, content_type, bytes).await
    })
    .await;
    if let Err(e) = upload {
      self.repository.release_storage(user_id, size_bytes).await?;
      return Err(e);
    }

    Ok(StagedAsset::Stored(NewAsset {
      id: asset_id,
      role,
      content_type: Some(content_type.to_string()),
      file_name,
      source_url,
      size_bytes,
      content_hash: Some(content_hash(bytes)),
    }))
  }

  pub async fn fetch(&self, user_id: &str, asset_id: &str) -> Result<Vec<u8>> {
    self.store.get(user_id, asset_id).await
  }

  pub async fn delete(&self, user_id: &str, asset_id: &str, size_bytes: u64) -> Result<()> {
    self.store.delete(user_id, asset_id).await?;
    self.repository.release_storage(user_id, size_bytes).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_content_hash_is_stable_hex() {
    let hash = content_hash(b"magpie");
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, content_hash(b"magpie"));
    assert_ne!(hash, content_hash(b"magpie2"));
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
