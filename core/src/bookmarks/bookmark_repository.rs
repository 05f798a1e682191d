use super::bookmark::{
  AssetRole, Bookmark, BookmarkAsset, BookmarkKind, CrawlFinalization, CrawlMetadataUpdate,
  CrawlStatus, EnrichmentStatus, LinkDetails, NewAsset, NewBookmark, NewBookmarkPayload,
  TextDetails,
};
use crate::sqlite::SqliteConnection;
use anyhow::{anyhow, Result};
use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::{str::FromStr, sync::Arc};
use tracing::error;
use ulid::Ulid;

fn row_to_asset(row: &rusqlite::Row) -> rusqlite::Result<BookmarkAsset> {
  Ok(BookmarkAsset {
    id: row.get(0)?,
    bookmark_id: row.get(1)?,
    role: AssetRole::from_str(row.get::<_, String>(2)?.as_str()).unwrap(),
    content_type: row.get(3)?,
    file_name: row.get(4)?,
    source_url: row.get(5)?,
    size_bytes: row.get(6)?,
    content_hash: row.get(7)?,
  })
}

const ASSET_COLUMNS: &str =
  "id, bookmark_id, role, content_type, file_name, source_url, size_bytes, content_hash";

fn load_assets(conn: &Connection, bookmark_id: &str) -> rusqlite::Result<Vec<BookmarkAsset>> {
  let mut statement = conn.prepare(&format!(
    "SELECT {ASSET_COLUMNS} FROM bookmark_assets WHERE bookmark_id = ?1 ORDER BY created_at"
  ))?;
  let assets = statement
    .query_map(params![bookmark_id], row_to_asset)?
    .collect::<Result<Vec<_>, _>>()?;
  Ok(assets)
}

fn load_bookmark(conn: &Connection, bookmark_id: &str) -> rusqlite::Result<Option<Bookmark>> {
  let base: Option<(String, String, String, NaiveDateTime, Option<NaiveDateTime>)> = conn
    .query_row(
      "SELECT id, user_id, kind, created_at, modified_at FROM bookmarks WHERE id = ?1",
      params![bookmark_id],
      |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      },
    )
    .optional()?;
  let Some((id, user_id, kind, created_at, modified_at)) = base else {
    return Ok(None);
  };
  let kind = BookmarkKind::from_str(&kind).unwrap();

  let link = conn
    .query_row(
      "SELECT url, title, description, author, publisher, date_published, date_modified,
              favicon, image_url, crawled_at, crawl_status, crawl_status_code, html_content,
              content_asset_id, summary, tagging_status, summarization_status
       FROM bookmark_links WHERE bookmark_id = ?1",
      params![id],
      |row| {
        Ok(LinkDetails {
          url: row.get(0)?,
          title: row.get(1)?,
          description: row.get(2)?,
          author: row.get(3)?,
          publisher: row.get(4)?,
          date_published: row.get(5)?,
          date_modified: row.get(6)?,
          favicon: row.get(7)?,
          image_url: row.get(8)?,
          crawled_at: row.get(9)?,
          crawl_status: row
            .get::<_, Option<String>>(10)?
            .map(|s| CrawlStatus::from_str(&s).unwrap()),
          crawl_status_code: row.get(11)?,
          html_content: row.get(12)?,
          content_asset_id: row.get(13)?,
          summary: row.get(14)?,
          tagging_status: row
            .get::<_, Option<String>>(15)?
            .map(|s| EnrichmentStatus::from_str(&s).unwrap()),
          summarization_status: row
            .get::<_, Option<String>>(16)?
            .map(|s| EnrichmentStatus::from_str(&s).unwrap()),
        })
      },
    )
    .optional()?;

  let text = conn
    .query_row(
      "SELECT text, source_url FROM bookmark_texts WHERE bookmark_id = ?1",
      params![id],
      |row| {
        Ok(TextDetails {
          text: row.get(0)?,
          source_url: row.get(1)?,
        })
      },
    )
    .optional()?;

  let assets = load_assets(conn, &id)?;

  Ok(Some(Bookmark {
    id,
    user_id,
    kind,
    created_at,
    modified_at,
    link,
    text,
    assets,
  }))
}

fn insert_asset(tx: &Transaction, bookmark_id: &str, asset: &NewAsset) -> rusqlite::Result<String> {
  tx.execute(
    "INSERT INTO bookmark_assets
       (id, bookmark_id, role, content_type, file_name, source_url, size_bytes, content_hash)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    params![
      asset.id,
      bookmark_id,
      asset.role.to_string(),
      asset.content_type,
      asset.file_name,
      asset.source_url,
      asset.size_bytes,
      asset.content_hash,
    ],
  )?;
  Ok(asset.id.clone())
}

#[derive(Clone)]
pub struct BookmarkRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

impl BookmarkRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  pub async fn insert(&self, record: NewBookmark) -> Result<Bookmark> {
    let id = Ulid::new().to_string();
    let bookmark_id = id.clone();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        let kind = match &record.payload {
          NewBookmarkPayload::Link { .. } => BookmarkKind::Link,
          NewBookmarkPayload::Text { .. } => BookmarkKind::Text,
          NewBookmarkPayload::Asset(_) => BookmarkKind::Asset,
        };
        tx.execute(
          "INSERT INTO bookmarks (id, user_id, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
          params![
            id,
            record.user_id,
            kind.to_string(),
            Utc::now().naive_utc()
          ],
        )?;
        match &record.payload {
          NewBookmarkPayload::Link { url } => {
            tx.execute(
              "INSERT INTO bookmark_links (bookmark_id, url, title, crawl_status)
               VALUES (?1, ?2, ?3, 'pending')",
              params![id, url, record.title],
            )?;
          }
          NewBookmarkPayload::Text { text, source_url } => {
            tx.execute(
              "INSERT INTO bookmark_texts (bookmark_id, text, source_url) VALUES (?1, ?2, ?3)",
              params![id, text, source_url],
            )?;
          }
          NewBookmarkPayload::Asset(asset) => {
            insert_asset(&tx, &id, asset)?;
          }
        }
        tx.commit()?;
        load_bookmark(conn, &id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to insert bookmark");
        anyhow!("Failed to insert bookmark")
      })?
      .map_err(|e| {
        error!(
          bookmark_id = bookmark_id.as_str(),
          message = e.to_string(),
          "Failed to insert bookmark"
        );
        anyhow!("Failed to insert bookmark")
      })
  }

  pub async fn find(&self, bookmark_id: &str) -> Result<Option<Bookmark>> {
    let bookmark_id = bookmark_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| load_bookmark(conn, &bookmark_id))
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to load bookmark");
        anyhow!("Failed to load bookmark")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to load bookmark");
        anyhow!("Failed to load bookmark")
      })
  }

  /// Duplicate detection for the shared create path: an existing link
  /// bookmark for the same user and URL wins over a new insert.
  pub async fn find_link_by_url(&self, user_id: &str, url: &str) -> Result<Option<String>> {
    let user_id = user_id.to_string();
    let url = url.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn
          .query_row(
            "SELECT b.id FROM bookmarks b
             JOIN bookmark_links l ON l.bookmark_id = b.id
             WHERE b.user_id = ?1 AND l.url = ?2",
            params![user_id, url],
            |row| row.get(0),
          )
          .optional()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to look up bookmark by url");
        anyhow!("Failed to look up bookmark by url")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to look up bookmark by url");
        anyhow!("Failed to look up bookmark by url")
      })
  }

  /// A crawl attempt starts from a clean slate; a retry of a failed crawl
  /// goes back through pending.
  pub async fn begin_crawl(&self, bookmark_id: &str) -> Result<()> {
    let bookmark_id = bookmark_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE bookmark_links
           SET crawl_status = 'pending', crawl_status_code = NULL
           WHERE bookmark_id = ?1",
          params![bookmark_id],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to begin crawl");
        anyhow!("Failed to begin crawl")
      })?
  }

  pub async fn update_link_metadata(
    &self,
    bookmark_id: &str,
    update: CrawlMetadataUpdate,
  ) -> Result<()> {
    let bookmark_id = bookmark_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE bookmark_links
           SET title = COALESCE(?2, title),
               description = ?3,
               author = ?4,
               publisher = ?5,
               date_published = ?6,
               date_modified = ?7,
               favicon = COALESCE(?8, favicon),
               image_url = ?9,
               crawl_status_code = ?10,
               crawl_status = 'success'
           WHERE bookmark_id = ?1",
          params![
            bookmark_id,
            update.title,
            update.description,
            update.author,
            update.publisher,
            update.date_published,
            update.date_modified,
            update.favicon,
            update.image_url,
            update.crawl_status_code,
          ],
        )?;
        conn.execute(
          "UPDATE bookmarks SET modified_at = ?2 WHERE id = ?1",
          params![bookmark_id, Utc::now().naive_utc()],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to write crawl metadata");
        anyhow!("Failed to write crawl metadata")
      })?
  }

  /// Phase-2 write. One transaction sets `crawled_at`, swaps in the captured
  /// content and asset rows, and removes superseded rows for the roles being
  /// replaced. The removed rows are returned so their blobs can be deleted
  /// outside the transaction.
  pub async fn finalize_crawl(
    &self,
    bookmark_id: &str,
    finalization: CrawlFinalization,
  ) -> Result<Vec<BookmarkAsset>> {
    let bookmark_id = bookmark_id.to_string();
    let crawled_at = Utc::now().naive_utc();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "UPDATE bookmark_links
           SET crawled_at = ?2, html_content = ?3, content_asset_id = ?4
           WHERE bookmark_id = ?1",
          params![
            bookmark_id,
            crawled_at,
            finalization.html_content,
            finalization.content_asset_id,
          ],
        )?;

        let replaced_roles = finalization
          .new_assets
          .iter()
          .map(|asset| asset.role)
          .collect::<Vec<_>>();
        let mut superseded = Vec::new();
        for role in replaced_roles {
          let mut statement = tx.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM bookmark_assets WHERE bookmark_id = ?1 AND role = ?2"
          ))?;
          let existing = statement
            .query_map(params![bookmark_id, role.to_string()], row_to_asset)?
            .collect::<Result<Vec<_>, _>>()?;
          drop(statement);
          for asset in existing {
            tx.execute(
              "DELETE FROM bookmark_assets WHERE id = ?1",
              params![asset.id],
            )?;
            superseded.push(asset);
          }
        }
        for asset in &finalization.new_assets {
          insert_asset(&tx, &bookmark_id, asset)?;
        }
        tx.commit()?;
        Ok::<_, rusqlite::Error>(superseded)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to finalize crawl");
        anyhow!("Failed to finalize crawl")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to finalize crawl");
        anyhow!("Failed to finalize crawl")
      })
  }

  /// Permanent crawl failure. Dependent enrichment statuses that never got a
  /// chance to run are cleared rather than left pending forever.
  pub async fn mark_crawl_failure(
    &self,
    bookmark_id: &str,
    status_code: Option<u16>,
  ) -> Result<()> {
    let bookmark_id = bookmark_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE bookmark_links
           SET crawl_status = 'failure',
               crawl_status_code = COALESCE(?2, crawl_status_code),
               tagging_status = CASE WHEN tagging_status = 'pending' THEN NULL ELSE tagging_status END,
               summarization_status = CASE WHEN summarization_status = 'pending' THEN NULL ELSE summarization_status END
           WHERE bookmark_id = ?1",
          params![bookmark_id, status_code],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to mark crawl failure");
        anyhow!("Failed to mark crawl failure")
      })?
  }

  /// Content-type morph: a link that resolved to a binary becomes an asset
  /// bookmark in one transaction.
  pub async fn morph_to_asset(&self, bookmark_id: &str, asset: NewAsset) -> Result<String> {
    let bookmark_id = bookmark_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "DELETE FROM bookmark_links WHERE bookmark_id = ?1",
          params![bookmark_id],
        )?;
        tx.execute(
          "UPDATE bookmarks SET kind = 'asset', modified_at = ?2 WHERE id = ?1",
          params![bookmark_id, Utc::now().naive_utc()],
        )?;
        let asset_id = insert_asset(&tx, &bookmark_id, &asset)?;
        tx.commit()?;
        Ok::<_, rusqlite::Error>(asset_id)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to morph bookmark");
        anyhow!("Failed to morph bookmark")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to morph bookmark");
        anyhow!("Failed to morph bookmark")
      })
  }

  pub async fn set_summary(&self, bookmark_id: &str, summary: &str) -> Result<()> {
    let bookmark_id = bookmark_id.to_string();
    let summary = summary.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE bookmark_links SET summary = ?2 WHERE bookmark_id = ?1",
          params![bookmark_id, summary],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to set summary");
        anyhow!("Failed to set summary")
      })?
  }

  pub async fn set_tagging_status(
    &self,
    bookmark_id: &str,
    status: Option<EnrichmentStatus>,
  ) -> Result<()> {
    self
      .set_enrichment_status(bookmark_id, "tagging_status", status)
      .await
  }

  pub async fn set_summarization_status(
    &self,
    bookmark_id: &str,
    status: Option<EnrichmentStatus>,
  ) -> Result<()> {
    self
      .set_enrichment_status(bookmark_id, "summarization_status", status)
      .await
  }

  async fn set_enrichment_status(
    &self,
    bookmark_id: &str,
    column: &'static str,
    status: Option<EnrichmentStatus>,
  ) -> Result<()> {
    let bookmark_id = bookmark_id.to_string();
    let status = status.map(|s| s.to_string());
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          &format!("UPDATE bookmark_links SET {column} = ?2 WHERE bookmark_id = ?1"),
          params![bookmark_id, status],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to set enrichment status");
        anyhow!("Failed to set enrichment status")
      })?
  }

  pub async fn add_asset(&self, bookmark_id: &str, asset: NewAsset) -> Result<String> {
    let bookmark_id = bookmark_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        let asset_id = insert_asset(&tx, &bookmark_id, &asset)?;
        tx.commit()?;
        Ok::<_, rusqlite::Error>(asset_id)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to add asset");
        anyhow!("Failed to add asset")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to add asset");
        anyhow!("Failed to add asset")
      })
  }

  pub async fn attach_tags(
    &self,
    bookmark_id: &str,
    user_id: &str,
    names: Vec<String>,
    attached_by: &str,
  ) -> Result<()> {
    let bookmark_id = bookmark_id.to_string();
    let user_id = user_id.to_string();
    let attached_by = attached_by.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        for name in names {
          let name = name.trim().to_string();
          if name.is_empty() {
            continue;
          }
          tx.execute(
            "INSERT INTO tags (id, user_id, name) VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id, name) DO NOTHING",
            params![Ulid::new().to_string(), user_id, name],
          )?;
          let tag_id: String = tx.query_row(
            "SELECT id FROM tags WHERE user_id = ?1 AND name = ?2",
            params![user_id, name],
            |row| row.get(0),
          )?;
          tx.execute(
            "INSERT INTO bookmark_tags (bookmark_id, tag_id, attached_by)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (bookmark_id, tag_id) DO NOTHING",
            params![bookmark_id, tag_id, attached_by],
          )?;
        }
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to attach tags");
        anyhow!("Failed to attach tags")
      })?
  }

  pub async fn tag_names(&self, bookmark_id: &str) -> Result<Vec<String>> {
    let bookmark_id = bookmark_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "SELECT t.name FROM tags t
           JOIN bookmark_tags bt ON bt.tag_id = t.id
           WHERE bt.bookmark_id = ?1
           ORDER BY t.name",
        )?;
        let names = statement
          .query_map(params![bookmark_id], |row| row.get(0))?
          .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to load tags");
        anyhow!("Failed to load tags")
      })?
      .map_err(|e: rusqlite::Error| {
        error!(message = e.to_string(), "Failed to load tags");
        anyhow!("Failed to load tags")
      })
  }

  pub async fn add_to_lists(&self, bookmark_id: &str, list_ids: Vec<String>) -> Result<()> {
    let bookmark_id = bookmark_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        for list_id in list_ids {
          tx.execute(
            "INSERT INTO bookmark_lists (list_id, bookmark_id) VALUES (?1, ?2)
             ON CONFLICT DO NOTHING",
            params![list_id, bookmark_id],
          )?;
        }
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to add bookmark to lists");
        anyhow!("Failed to add bookmark to lists")
      })?
  }

  /// Swaps in an asset for its role, returning the rows it superseded so
  /// their blobs can be reaped. Used by the archive step, which runs after
  /// the phase-2 transaction.
  pub async fn replace_asset(
    &self,
    bookmark_id: &str,
    asset: NewAsset,
  ) -> Result<Vec<BookmarkAsset>> {
    let bookmark_id = bookmark_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        let mut statement = tx.prepare(&format!(
          "SELECT {ASSET_COLUMNS} FROM bookmark_assets WHERE bookmark_id = ?1 AND role = ?2"
        ))?;
        let superseded = statement
          .query_map(params![bookmark_id, asset.role.to_string()], row_to_asset)?
          .collect::<Result<Vec<_>, _>>()?;
        drop(statement);
        for old in &superseded {
          tx.execute("DELETE FROM bookmark_assets WHERE id = ?1", params![old.id])?;
        }
        insert_asset(&tx, &bookmark_id, &asset)?;
        tx.commit()?;
        Ok::<_, rusqlite::Error>(superseded)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to replace asset");
        anyhow!("Failed to replace asset")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to replace asset");
        anyhow!("Failed to replace asset")
      })
  }

  pub async fn update_asset_hash(
    &self,
    asset_id: &str,
    content_hash: &str,
    size_bytes: u64,
  ) -> Result<()> {
    let asset_id = asset_id.to_string();
    let content_hash = content_hash.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE bookmark_assets SET content_hash = ?2, size_bytes = ?3 WHERE id = ?1",
          params![asset_id, content_hash, size_bytes],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to update asset hash");
        anyhow!("Failed to update asset hash")
      })?
  }

  /// Quota check and byte reservation in one transaction. Returns false
  /// without reserving when the user is over quota.
  pub async fn reserve_storage(&self, user_id: &str, bytes: u64) -> Result<bool> {
    let user_id = user_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO user_storage (user_id, bytes_used) VALUES (?1, 0)
           ON CONFLICT (user_id) DO NOTHING",
          params![user_id],
        )?;
        let (bytes_used, quota_bytes): (u64, Option<u64>) = tx.query_row(
          "SELECT bytes_used, quota_bytes FROM user_storage WHERE user_id = ?1",
          params![user_id],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if let Some(quota) = quota_bytes {
          if bytes_used + bytes > quota {
            return Ok(false);
          }
        }
        tx.execute(
          "UPDATE user_storage SET bytes_used = bytes_used + ?2 WHERE user_id = ?1",
          params![user_id, bytes],
        )?;
        tx.commit()?;
        Ok::<_, rusqlite::Error>(true)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to reserve storage");
        anyhow!("Failed to reserve storage")
      })?
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to reserve storage");
        anyhow!("Failed to reserve storage")
      })
  }

  pub async fn release_storage(&self, user_id: &str, bytes: u64) -> Result<()> {
    let user_id = user_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE user_storage
           SET bytes_used = MAX(bytes_used - ?2, 0)
           WHERE user_id = ?1",
          params![user_id, bytes],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to release storage");
        anyhow!("Failed to release storage")
      })?
  }

  pub async fn set_storage_quota(&self, user_id: &str, quota_bytes: Option<u64>) -> Result<()> {
    let user_id = user_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "INSERT INTO user_storage (user_id, bytes_used, quota_bytes) VALUES (?1, 0, ?2)
           ON CONFLICT (user_id) DO UPDATE SET quota_bytes = excluded.quota_bytes",
          params![user_id, quota_bytes],
        )?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to set storage quota");
        anyhow!("Failed to set storage quota")
      })?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    bookmarks::bookmark::CrawlPriority,
    helpers::test::test_sqlite_connection,
  };

  async fn test_repository() -> Result<(BookmarkRepository, tempfile::TempDir)> {
    let (connection, dir) = test_sqlite_connection().await?;
    Ok((BookmarkRepository::new(Arc::new(connection)), dir))
  }

  fn new_link(user_id: &str, url: &str) -> NewBookmark {
    NewBookmark {
      user_id: user_id.to_string(),
      payload: NewBookmarkPayload::Link {
        url: url.to_string(),
      },
      title: None,
      crawl_priority: CrawlPriority::Normal,
      archive_full_page: false,
    }
  }

  #[tokio::test]
  async fn test_insert_and_find_link_bookmark() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let bookmark = repository
      .insert(new_link("u1", "https://example.com/post"))
      .await?;
    assert_eq!(bookmark.kind, BookmarkKind::Link);
    let link = bookmark.link().unwrap();
    assert_eq!(link.url, "https://example.com/post");
    assert_eq!(link.crawl_status, Some(CrawlStatus::Pending));

    assert_eq!(
      repository
        .find_link_by_url("u1", "https://example.com/post")
        .await?,
      Some(bookmark.id.clone())
    );
    assert_eq!(
      repository
        .find_link_by_url("u2", "https://example.com/post")
        .await?,
      None
    );
    Ok(())
  }

  #[tokio::test]
  async fn test_phase_one_write_marks_success() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let bookmark = repository.insert(new_link("u1", "https://example.com")).await?;
    repository
      .update_link_metadata(
        &bookmark.id,
        CrawlMetadataUpdate {
          title: Some("Example".to_string()),
          description: Some("A page".to_string()),
          crawl_status_code: Some(200),
          ..Default::default()
        },
      )
      .await?;

    let stored = repository.find(&bookmark.id).await?.unwrap();
    let link = stored.link().unwrap();
    assert_eq!(link.title.as_deref(), Some("Example"));
    assert_eq!(link.crawl_status, Some(CrawlStatus::Success));
    assert_eq!(link.crawl_status_code, Some(200));
    assert!(link.crawled_at.is_none(), "crawled_at belongs to phase two");
    Ok(())
  }

  #[tokio::test]
  async fn test_finalize_swaps_superseded_assets() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let bookmark = repository.insert(new_link("u1", "https://example.com")).await?;
    let mut old_screenshot = NewAsset::with_role(AssetRole::Screenshot);
    old_screenshot.content_type = Some("image/jpeg".to_string());
    old_screenshot.size_bytes = 100;
    let old_id = repository.add_asset(&bookmark.id, old_screenshot).await?;

    let mut new_screenshot = NewAsset::with_role(AssetRole::Screenshot);
    new_screenshot.content_type = Some("image/jpeg".to_string());
    new_screenshot.size_bytes = 240;
    let superseded = repository
      .finalize_crawl(
        &bookmark.id,
        CrawlFinalization {
          html_content: Some("<p>hello</p>".to_string()),
          content_asset_id: None,
          new_assets: vec![new_screenshot],
        },
      )
      .await?;
    assert_eq!(superseded.len(), 1);
    assert_eq!(superseded[0].id, old_id);

    let stored = repository.find(&bookmark.id).await?.unwrap();
    assert_eq!(stored.assets.len(), 1);
    assert_ne!(stored.assets[0].id, old_id);
    assert!(stored.link().unwrap().crawled_at.is_some());
    assert_eq!(stored.link().unwrap().html_content.as_deref(), Some("<p>hello</p>"));
    Ok(())
  }

  #[tokio::test]
  async fn test_crawl_failure_clears_pending_enrichment() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let bookmark = repository.insert(new_link("u1", "https://example.com")).await?;
    repository
      .set_tagging_status(&bookmark.id, Some(EnrichmentStatus::Pending))
      .await?;
    repository
      .set_summarization_status(&bookmark.id, Some(EnrichmentStatus::Success))
      .await?;

    repository.mark_crawl_failure(&bookmark.id, Some(500)).await?;

    let stored = repository.find(&bookmark.id).await?.unwrap();
    let link = stored.link().unwrap();
    assert_eq!(link.crawl_status, Some(CrawlStatus::Failure));
    assert_eq!(link.crawl_status_code, Some(500));
    assert_eq!(link.tagging_status, None);
    // Enrichment that already finished is left alone.
    assert_eq!(link.summarization_status, Some(EnrichmentStatus::Success));
    Ok(())
  }

  #[tokio::test]
  async fn test_morph_to_asset_removes_link_row() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let bookmark = repository
      .insert(new_link("u1", "https://example.com/doc.pdf"))
      .await?;
    let mut primary = NewAsset::with_role(AssetRole::Primary);
    primary.content_type = Some("application/pdf".to_string());
    primary.file_name = Some("doc.pdf".to_string());
    primary.source_url = Some("https://example.com/doc.pdf".to_string());
    primary.size_bytes = 4096;
    repository.morph_to_asset(&bookmark.id, primary).await?;

    let stored = repository.find(&bookmark.id).await?.unwrap();
    assert_eq!(stored.kind, BookmarkKind::Asset);
    assert!(stored.link.is_none(), "bookmark_links row must be gone");
    let primary = stored.asset_with_role(AssetRole::Primary).unwrap();
    assert_eq!(primary.content_type.as_deref(), Some("application/pdf"));
    Ok(())
  }

  #[tokio::test]
  async fn test_storage_reservation_respects_quota() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    repository.set_storage_quota("u1", Some(1000)).await?;

    assert!(repository.reserve_storage("u1", 600).await?);
    assert!(repository.reserve_storage("u1", 400).await?);
    assert!(!repository.reserve_storage("u1", 1).await?);

    repository.release_storage("u1", 400).await?;
    assert!(repository.reserve_storage("u1", 300).await?);

    // No quota row value means unlimited.
    assert!(repository.reserve_storage("u2", u32::MAX as u64).await?);
    Ok(())
  }

  #[tokio::test]
  async fn test_attach_tags_deduplicates() -> Result<()> {
    let (repository, _dir) = test_repository().await?;
    let bookmark = repository.insert(new_link("u1", "https://example.com")).await?;
    repository
      .attach_tags(
        &bookmark.id,
        "u1",
        vec!["rust".to_string(), "queues".to_string()],
        "ai",
      )
      .await?;
    repository
      .attach_tags(&bookmark.id, "u1", vec!["rust".to_string()], "human")
      .await?;

    assert_eq!(
      repository.tag_names(&bookmark.id).await?,
      vec!["queues".to_string(), "rust".to_string()]
    );
    Ok(())
  }
}
