use crate::settings::Settings;
use anyhow::{anyhow, Result};
use deadpool_sqlite::{Config, Hook, HookError, Object, Pool, Runtime};
use include_dir::{include_dir, Dir};
use lazy_static::lazy_static;
use rusqlite::vtab;
use rusqlite_migration::Migrations;
use std::{path::Path, sync::Arc};
use tracing::{error, info, instrument};

static MIGRATIONS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/migrations");

lazy_static! {
  static ref MIGRATIONS: Migrations<'static> = Migrations::from_directory(&MIGRATIONS_DIR).unwrap();
}

fn prepare_connection(conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
  conn.pragma_update(None, "journal_mode", "WAL")?;
  conn.pragma_update(None, "foreign_keys", "ON")?;
  conn.pragma_update(None, "synchronous", "NORMAL")?;
  conn.pragma_update(None, "busy_timeout", 5000)?;
  vtab::array::load_module(conn)?;
  Ok(())
}

fn build_pool(config: &Config, max_size: Option<usize>) -> Result<Pool> {
  let mut builder = config
    .builder(Runtime::Tokio1)?
    .post_create(Hook::async_fn(|wrapper, _| {
      Box::pin(async move {
        wrapper
          .interact(|conn| prepare_connection(conn))
          .await
          .map_err(|e| HookError::Message(format!("Connection setup failed: {:?}", e).into()))?
          .map_err(|e| HookError::Message(format!("Connection setup failed: {:?}", e).into()))
      })
    }));
  if let Some(max_size) = max_size {
    builder = builder.max_size(max_size);
  }
  builder.build().map_err(|e| {
    error!("Failed to build SQLite pool: {:?}", e);
    anyhow!("Failed to build SQLite pool: {:?}", e)
  })
}

/// Read pool plus a single-connection write pool; SQLite allows many readers
/// but only one writer.
#[derive(Clone, Debug)]
pub struct SqliteConnection {
  read_pool: Arc<Pool>,
  write_pool: Arc<Pool>,
}

impl SqliteConnection {
  pub async fn new(settings: Arc<Settings>) -> Result<Self> {
    std::fs::create_dir_all(&settings.sqlite.dir)?;
    Self::at_path(Path::new(&settings.sqlite.dir).join("magpie.db")).await
  }

  pub async fn at_path(path: impl AsRef<Path>) -> Result<Self> {
    let config = Config::new(path.as_ref());
    let connection = Self {
      write_pool: Arc::new(build_pool(&config, Some(1))?),
      read_pool: Arc::new(build_pool(&config, None)?),
    };

    connection
      .write()
      .await?
      .interact(|conn| MIGRATIONS.to_latest(conn))
      .await
      .map_err(|e| anyhow!("Migration task failed: {:?}", e))?
      .map_err(|e| {
        error!("Failed to migrate database: {:?}", e);
        anyhow!("Failed to migrate database: {:?}", e)
      })?;
    info!("Sqlite database migrated to latest version");

    Ok(connection)
  }

  #[instrument(skip(self), name = "acquire-sqlite-read-connection")]
  pub async fn read(&self) -> Result<Object> {
    self.read_pool.get().await.map_err(|e| {
      error!("Failed to get SQLite connection: {:?}", e);
      anyhow!("Failed to get SQLite connection: {:?}", e)
    })
  }

  #[instrument(skip(self), name = "acquire-sqlite-write-connection")]
  pub async fn write(&self) -> Result<Object> {
    self.write_pool.get().await.map_err(|e| {
      error!("Failed to get SQLite connection: {:?}", e);
      anyhow!("Failed to get SQLite connection: {:?}", e)
    })
  }
}
