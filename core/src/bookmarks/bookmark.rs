use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookmarkKind {
  Link,
  Text,
  Asset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
  Pending,
  Success,
  Failure,
}

/// Shared by tagging and summarization; absent means never requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
  Pending,
  Success,
  Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssetRole {
  /// The asset a `kind = asset` bookmark is about (uploaded file, morphed
  /// download).
  Primary,
  Screenshot,
  Pdf,
  BannerImage,
  FullPageArchive,
  PrecrawledArchive,
  Video,
  HtmlContent,
}

#[derive(Debug, Clone, Default)]
pub struct LinkDetails {
  pub url: String,
  pub title: Option<String>,
  pub description: Option<String>,
  pub author: Option<String>,
  pub publisher: Option<String>,
  pub date_published: Option<NaiveDateTime>,
  pub date_modified: Option<NaiveDateTime>,
  pub favicon: Option<String>,
  pub image_url: Option<String>,
  pub crawled_at: Option<NaiveDateTime>,
  pub crawl_status: Option<CrawlStatus>,
  pub crawl_status_code: Option<u16>,
  pub html_content: Option<String>,
  pub content_asset_id: Option<String>,
  pub summary: Option<String>,
  pub tagging_status: Option<EnrichmentStatus>,
  pub summarization_status: Option<EnrichmentStatus>,
}

#[derive(Debug, Clone)]
pub struct TextDetails {
  pub text: String,
  pub source_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BookmarkAsset {
  pub id: String,
  pub bookmark_id: String,
  pub role: AssetRole,
  pub content_type: Option<String>,
  pub file_name: Option<String>,
  pub source_url: Option<String>,
  pub size_bytes: u64,
  pub content_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Bookmark {
  pub id: String,
  pub user_id: String,
  pub kind: BookmarkKind,
  pub created_at: NaiveDateTime,
  pub modified_at: Option<NaiveDateTime>,
  pub link: Option<LinkDetails>,
  pub text: Option<TextDetails>,
  pub assets: Vec<BookmarkAsset>,
}

impl Bookmark {
  pub fn link(&self) -> Option<&LinkDetails> {
    self.link.as_ref()
  }

  pub fn asset_with_role(&self, role: AssetRole) -> Option<&BookmarkAsset> {
    self.assets.iter().find(|asset| asset.role == role)
  }
}

/// Crawl scheduling tier for a newly created bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrawlPriority {
  #[default]
  Normal,
  Low,
}

impl CrawlPriority {
  pub fn as_queue_priority(&self) -> u32 {
    match self {
      CrawlPriority::Normal => crate::queue::job::PRIORITY_USER,
      CrawlPriority::Low => crate::queue::job::PRIORITY_BULK,
    }
  }
}

#[derive(Debug, Clone)]
pub enum NewBookmarkPayload {
  Link { url: String },
  Text { text: String, source_url: Option<String> },
  Asset(NewAsset),
}

#[derive(Debug, Clone)]
pub struct NewBookmark {
  pub user_id: String,
  pub payload: NewBookmarkPayload,
  pub title: Option<String>,
  pub crawl_priority: CrawlPriority,
  pub archive_full_page: bool,
}

/// The id is minted by the caller so the blob can be uploaded under its
/// final key before the row lands in a transaction.
#[derive(Debug, Clone)]
pub struct NewAsset {
  pub id: String,
  pub role: AssetRole,
  pub content_type: Option<String>,
  pub file_name: Option<String>,
  pub source_url: Option<String>,
  pub size_bytes: u64,
  pub content_hash: Option<String>,
}

impl NewAsset {
  pub fn with_role(role: AssetRole) -> Self {
    Self {
      id: ulid::Ulid::new().to_string(),
      role,
      content_type: None,
      file_name: None,
      source_url: None,
      size_bytes: 0,
      content_hash: None,
    }
  }
}

/// Phase-1 write: the metadata that makes a crawl visible in the UI.
#[derive(Debug, Clone, Default)]
pub struct CrawlMetadataUpdate {
  pub title: Option<String>,
  pub description: Option<String>,
  pub author: Option<String>,
  pub publisher: Option<String>,
  pub date_published: Option<NaiveDateTime>,
  pub date_modified: Option<NaiveDateTime>,
  pub favicon: Option<String>,
  pub image_url: Option<String>,
  pub crawl_status_code: Option<u16>,
}

/// Phase-2 write: content and captured assets, applied in one transaction.
#[derive(Debug, Clone, Default)]
pub struct CrawlFinalization {
  pub html_content: Option<String>,
  pub content_asset_id: Option<String>,
  pub new_assets: Vec<NewAsset>,
}
