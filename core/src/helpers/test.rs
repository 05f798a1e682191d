use crate::sqlite::SqliteConnection;
use anyhow::Result;
use tempfile::TempDir;

/// Fresh migrated database in a temp directory. The directory must outlive
/// the connection, so both are returned.
pub async fn test_sqlite_connection() -> Result<(SqliteConnection, TempDir)> {
  let dir = TempDir::new()?;
  let connection = SqliteConnection::at_path(dir.path().join("magpie-test.db")).await?;
  Ok((connection, dir))
}
