use chrono::NaiveDateTime;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
  Staging,
  Pending,
  Running,
  Paused,
  Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StagingStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StagingResult {
  Accepted,
  SkippedDuplicate,
  Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StagingKind {
  Link,
  Text,
}

#[derive(Debug, Clone)]
pub struct ImportSession {
  pub id: String,
  pub user_id: String,
  pub name: String,
  pub root_list_id: Option<String>,
  pub status: SessionStatus,
  pub last_processed_at: Option<NaiveDateTime>,
  pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct StagingItem {
  pub id: String,
  pub session_id: String,
  pub user_id: String,
  pub kind: StagingKind,
  pub url: Option<String>,
  pub content: Option<String>,
  pub title: Option<String>,
  pub tags: Vec<String>,
  pub list_ids: Vec<String>,
  pub status: StagingStatus,
  pub processing_started_at: Option<NaiveDateTime>,
  pub completed_at: Option<NaiveDateTime>,
  pub result: Option<StagingResult>,
  pub result_reason: Option<String>,
  pub result_bookmark_id: Option<String>,
  pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewStagingItem {
  pub kind: StagingKind,
  pub url: Option<String>,
  pub content: Option<String>,
  pub title: Option<String>,
  pub tags: Vec<String>,
  pub list_ids: Vec<String>,
}
