use crate::settings::ContentStoreSettings;
use anyhow::{anyhow, Result};
use s3::{creds::Credentials, Bucket};

/// Blob storage for captured assets. Keys are `{user_id}/{asset_id}` so a
/// user's blobs can be enumerated and reaped together.
pub struct AssetStore {
  bucket: Bucket,
}

impl AssetStore {
  pub fn new(settings: &ContentStoreSettings) -> Result<Self> {
    Ok(Self {
      bucket: *Bucket::new(
        &settings.bucket,
        s3::Region::Custom {
          region: settings.region.clone(),
          endpoint: settings.endpoint.clone(),
        },
        Credentials::new(
          Some(&settings.key),
          Some(&settings.secret),
          None,
          None,
          None,
        )?,
      )?
      .with_path_style(),
    })
  }

  fn object_key(user_id: &str, asset_id: &str) -> String {
    format!("{}/{}", user_id, asset_id)
  }

  pub async fn put(
    &self,
    user_id: &str,
    asset_id: &str,
    content_type: &str,
    bytes: &[u8],
  ) -> Result<()> {
    self
      .bucket
      .put_object_with_content_type(Self::object_key(user_id, asset_id), bytes, content_type)
      .await?;
    Ok(())
  }

  pub async fn get(&self, user_id: &str, asset_id: &str) -> Result<Vec<u8>> {
    let response = self
      .bucket
      .get_object(Self::object_key(user_id, asset_id))
      .await?;
    if response.status_code() != 200 {
      return Err(anyhow!(
        "Unexpected content store status {}",
        response.status_code()
      ));
    }
    Ok(response.to_vec())
  }

  pub async fn delete(&self, user_id: &str, asset_id: &str) -> Result<()> {
    self
      .bucket
      .delete_object(Self::object_key(user_id, asset_id))
      .await?;
    Ok(())
  }
}
