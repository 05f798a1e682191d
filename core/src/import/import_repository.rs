use super::import_session::{
  ImportSession, NewStagingItem, SessionStatus, StagingItem, StagingKind, StagingResult,
  StagingStatus,
};
use crate::sqlite::SqliteConnection;
use anyhow::{anyhow, Result};
use chrono::{NaiveDateTime, TimeDelta, Utc};
use rusqlite::{params, types::Value, OptionalExtension};
use std::{rc::Rc, str::FromStr, sync::Arc, time::Duration};
use tracing::error;
use ulid::Ulid;

const ITEM_COLUMNS: &str = "
  i.id, i.session_id, s.user_id, i.kind, i.url, i.content, i.title, i.tags,
  i.list_ids, i.status, i.processing_started_at, i.completed_at, i.result,
  i.result_reason, i.result_bookmark_id, i.created_at
";

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<StagingItem> {
  Ok(StagingItem {
    id: row.get(0)?,
    session_id: row.get(1)?,
    user_id: row.get(2)?,
    kind: StagingKind::from_str(row.get::<_, String>(3)?.as_str()).unwrap(),
    url: row.get(4)?,
    content: row.get(5)?,
    title: row.get(6)?,
    tags: serde_json::from_str(row.get::<_, String>(7)?.as_str()).unwrap_or_default(),
    list_ids: serde_json::from_str(row.get::<_, String>(8)?.as_str()).unwrap_or_default(),
    status: StagingStatus::from_str(row.get::<_, String>(9)?.as_str()).unwrap(),
    processing_started_at: row.get(10)?,
    completed_at: row.get(11)?,
    result: row
      .get::<_, Option<String>>(12)?
      .map(|s| StagingResult::from_str(&s).unwrap()),
    result_reason: row.get(13)?,
    result_bookmark_id: row.get(14)?,
    created_at: row.get(15)?,
  })
}

#[derive(Clone)]
pub struct ImportRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

impl ImportRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  pub async fn create_session(
    &self,
    user_id: &str,
    name: &str,
    root_list_id: Option<String>,
  ) -> Result<String> {
    let id = Ulid::new().to_string();
    let session_id = id.clone();
    let user_id = user_id.to_string();
    let name = name.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "INSERT INTO import_sessions (id, user_id, name, root_list_id, status, created_at)
           VALUES (?1, ?2, ?3, ?4, 'staging', ?5)",
          params![id, user_id, name, root_list_id, Utc::now().naive_utc()],
        )?;
        Ok::<(), rusqlite::Error>(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to create import session");
        anyhow!("Failed to create import session")
      })??;
    Ok(session_id)
  }

  pub async fn add_staging_items(
    &self,
    session_id: &str,
    items: Vec<NewStagingItem>,
  ) -> Result<usize> {
    let session_id = session_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        let count = items.len();
        for item in items {
          tx.execute(
            "INSERT INTO import_staging_items
               (id, session_id, kind, url, content, title, tags, list_ids, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
            params![
              Ulid::new().to_string(),
              session_id,
              item.kind.to_string(),
              item.url,
              item.content,
              item.title,
              serde_json::to_string(&item.tags).unwrap_or_else(|_| "[]".to_string()),
              serde_json::to_string(&item.list_ids).unwrap_or_else(|_| "[]".to_string()),
              Utc::now().naive_utc(),
            ],
          )?;
        }
        tx.commit()?;
        Ok::<_, rusqlite::Error>(count)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to stage import items");
        anyhow!("Failed to stage import items")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to stage import items");
        anyhow!("Failed to stage import items")
      })
  }

  pub async fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
    let session_id = session_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE import_sessions SET status = ?2 WHERE id = ?1",
          params![session_id, status.to_string()],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to set session status");
        anyhow!("Failed to set session status")
      })?
  }

  pub async fn find_session(&self, session_id: &str) -> Result<Option<ImportSession>> {
    let session_id = session_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn
          .query_row(
            "SELECT id, user_id, name, root_list_id, status, last_processed_at, created_at
             FROM import_sessions WHERE id = ?1",
            params![session_id],
            |row| {
              Ok(ImportSession {
                id: row.get(0)?,
                user_id: row.get(1)?,
                name: row.get(2)?,
                root_list_id: row.get(3)?,
                status: SessionStatus::from_str(row.get::<_, String>(4)?.as_str()).unwrap(),
                last_processed_at: row.get(5)?,
                created_at: row.get(6)?,
              })
            },
          )
          .optional()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to load session");
        anyhow!("Failed to load session")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to load session");
        anyhow!("Failed to load session")
      })
  }

  /// Atomic claim with round-robin fairness across sessions: candidates are
  /// ordered by the owning session's `last_processed_at`, then age, and the
  /// UPDATE re-checks `status = 'pending'` so racing pollers cannot claim a
  /// row twice. Claimed sessions move to running.
  pub async fn claim_pending(&self, limit: u32) -> Result<Vec<StagingItem>> {
    let now = Utc::now().naive_utc();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        let mut statement = tx.prepare(
          "SELECT i.id FROM import_staging_items i
           JOIN import_sessions s ON s.id = i.session_id
           WHERE i.status = 'pending' AND s.status IN ('pending', 'running')
           ORDER BY s.last_processed_at ASC, i.created_at ASC
           LIMIT ?1",
        )?;
        let candidate_ids = statement
          .query_map(params![limit], |row| row.get::<_, String>(0))?
          .collect::<Result<Vec<_>, _>>()?;
        drop(statement);
        if candidate_ids.is_empty() {
          tx.commit()?;
          return Ok(Vec::new());
        }

        let ids = candidate_ids.into_iter().map(Value::from).collect::<Vec<_>>();
        let mut statement = tx.prepare(
          "UPDATE import_staging_items
           SET status = 'processing', processing_started_at = ?1
           WHERE id IN rarray(?2) AND status = 'pending'
           RETURNING id",
        )?;
        let claimed_ids = statement
          .query_map(params![now, Rc::new(ids)], |row| row.get::<_, String>(0))?
          .collect::<Result<Vec<_>, _>>()?;
        drop(statement);

        let claimed_values = claimed_ids
          .iter()
          .cloned()
          .map(Value::from)
          .collect::<Vec<_>>();
        let mut statement = tx.prepare(&format!(
          "SELECT {ITEM_COLUMNS} FROM import_staging_items i
           JOIN import_sessions s ON s.id = i.session_id
           WHERE i.id IN rarray(?1)"
        ))?;
        let items = statement
          .query_map(params![Rc::new(claimed_values)], row_to_item)?
          .collect::<Result<Vec<_>, _>>()?;
        drop(statement);

        for item in &items {
          tx.execute(
            "UPDATE import_sessions SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            params![item.session_id],
          )?;
        }
        tx.commit()?;
        Ok::<_, rusqlite::Error>(items)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to claim staging items");
        anyhow!("Failed to claim staging items")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to claim staging items");
        anyhow!("Failed to claim staging items")
      })
  }

  /// Stale recovery: claimed items that never produced a bookmark go back to
  /// pending. Items that did produce one are merely waiting on downstream
  /// crawl and tagging, and are left alone.
  pub async fn reset_stale_processing(&self, stale_threshold: Duration) -> Result<usize> {
    let cutoff = Utc::now().naive_utc()
      - TimeDelta::from_std(stale_threshold).unwrap_or_else(|_| TimeDelta::seconds(1800));
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let reset = conn.execute(
          "UPDATE import_staging_items
           SET status = 'pending', processing_started_at = NULL
           WHERE status = 'processing'
             AND result_bookmark_id IS NULL
             AND processing_started_at < ?1",
          params![cutoff],
        )?;
        Ok(reset)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to reset stale items");
        anyhow!("Failed to reset stale items")
      })?
  }

  /// Items claimed from a session that has since been paused are handed
  /// back; their sessions stop being claim sources until resumed.
  pub async fn release_paused_claims(&self) -> Result<usize> {
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let released = conn.execute(
          "UPDATE import_staging_items
           SET status = 'pending', processing_started_at = NULL
           WHERE status = 'processing'
             AND result_bookmark_id IS NULL
             AND session_id IN (SELECT id FROM import_sessions WHERE status = 'paused')",
          [],
        )?;
        Ok(released)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to release paused claims");
        anyhow!("Failed to release paused claims")
      })?
  }

  /// Processing items whose bookmark exists and may have settled downstream.
  pub async fn find_settling_items(&self) -> Result<Vec<StagingItem>> {
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "SELECT {ITEM_COLUMNS} FROM import_staging_items i
           JOIN import_sessions s ON s.id = i.session_id
           WHERE i.status = 'processing' AND i.result_bookmark_id IS NOT NULL"
        ))?;
        let items = statement
          .query_map([], row_to_item)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(items)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to load settling items");
        anyhow!("Failed to load settling items")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to load settling items");
        anyhow!("Failed to load settling items")
      })
  }

  pub async fn record_bookmark(&self, item_id: &str, bookmark_id: &str) -> Result<()> {
    let item_id = item_id.to_string();
    let bookmark_id = bookmark_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE import_staging_items
           SET result = 'accepted', result_bookmark_id = ?2
           WHERE id = ?1",
          params![item_id, bookmark_id],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to record staging bookmark");
        anyhow!("Failed to record staging bookmark")
      })?
  }

  pub async fn finish_item(
    &self,
    item_id: &str,
    status: StagingStatus,
    result: StagingResult,
    reason: Option<&str>,
  ) -> Result<()> {
    let item_id = item_id.to_string();
    let reason = reason.map(|r| r.to_string());
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE import_staging_items
           SET status = ?2, result = ?3, result_reason = ?4, completed_at = ?5
           WHERE id = ?1",
          params![
            item_id,
            status.to_string(),
            result.to_string(),
            reason,
            Utc::now().naive_utc(),
          ],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to finish staging item");
        anyhow!("Failed to finish staging item")
      })?
  }

  pub async fn touch_session(&self, session_id: &str, at: NaiveDateTime) -> Result<()> {
    let session_id = session_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE import_sessions SET last_processed_at = ?2 WHERE id = ?1",
          params![session_id, at],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to touch session");
        anyhow!("Failed to touch session")
      })?
  }

  /// Sessions whose staging pool has fully drained are completed.
  pub async fn complete_drained_sessions(&self) -> Result<usize> {
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let completed = conn.execute(
          "UPDATE import_sessions SET status = 'completed'
           WHERE status IN ('pending', 'running')
             AND NOT EXISTS (
               SELECT 1 FROM import_staging_items i
               WHERE i.session_id = import_sessions.id
                 AND i.status IN ('pending', 'processing')
             )",
          [],
        )?;
        Ok(completed)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to complete drained sessions");
        anyhow!("Failed to complete drained sessions")
      })?
  }

  pub async fn processing_count(&self) -> Result<u64> {
    self.count_items_by_status("processing").await
  }

  pub async fn pending_count(&self) -> Result<u64> {
    self.count_items_by_status("pending").await
  }

  async fn count_items_by_status(&self, status: &'static str) -> Result<u64> {
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn.query_row(
          "SELECT COUNT(*) FROM import_staging_items WHERE status = ?1",
          params![status],
          |row| row.get(0),
        )
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to count staging items");
        anyhow!("Failed to count staging items")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to count staging items");
        anyhow!("Failed to count staging items")
      })
  }

  pub async fn session_status_counts(&self) -> Result<Vec<(String, u64)>> {
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement =
          conn.prepare("SELECT status, COUNT(*) FROM import_sessions GROUP BY status")?;
        let counts = statement
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(counts)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to count sessions");
        anyhow!("Failed to count sessions")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to count sessions");
        anyhow!("Failed to count sessions")
      })
  }
}
