use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::migrate::{MigrateDatabase, Migrator};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Connection, Sqlite, SqliteConnection, SqlitePool};

use super::{decode_message, encode_message, Persister, SCHEMA_VERSION};
use crate::inapp::error::PersistenceError;
use crate::inapp::message::Message;

pub static MIGRATOR: LazyLock<Migrator> = LazyLock::new(|| sqlx::migrate!("./db_migrations"));

pub const DEFAULT_DB_NAME: &str = "inapp_messages.sqlite";

const DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DB_MAX_CONNECTIONS: u32 = 4;
const DB_BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(Debug)]
struct StoredMessageRow {
    message_id: String,
    schema_version: i64,
    record: String,
    updated_at: DateTime<Utc>,
}

impl<'r, R> sqlx::FromRow<'r, R> for StoredMessageRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let message_id: String = row.try_get("message_id")?;
        let schema_version: i64 = row.try_get("schema_version")?;
        let record: String = row.try_get("record")?;
        let updated_at_i64: i64 = row.try_get("updated_at")?;

        let updated_at = DateTime::from_timestamp_millis(updated_at_i64).ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: "updated_at".to_string(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid timestamp",
                )),
            }
        })?;

        Ok(StoredMessageRow {
            message_id,
            schema_version,
            record,
            updated_at,
        })
    }
}

impl StoredMessageRow {
    fn into_message(self) -> Option<Message> {
        if self.schema_version > SCHEMA_VERSION {
            tracing::warn!(
                target: "inapp_engine::persistence::database::into_message",
                "Row {} has schema version {}, decoding known fields only",
                self.message_id,
                self.schema_version
            );
        }
        let record: Value = match serde_json::from_str(&self.record) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    target: "inapp_engine::persistence::database::into_message",
                    "Dropping corrupt row {} (updated {}): {}",
                    self.message_id,
                    self.updated_at,
                    e
                );
                return None;
            }
        };
        decode_message(&record)
    }
}

/// Stores one row per message in a SQLite database, rewritten in a single
/// transaction on every save.
#[derive(Clone, Debug)]
pub struct SqlitePersister {
    pub pool: SqlitePool,
    pub path: PathBuf,
}

impl SqlitePersister {
    /// Opens the store at `db_path`, creating it if needed. A file that
    /// SQLite cannot read or migrate is deleted along with its `-wal` and
    /// `-shm` files and recreated empty.
    pub async fn new(db_path: PathBuf) -> Result<Self, PersistenceError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match Self::open(&db_path).await {
            Ok(persister) => Ok(persister),
            Err(e) => {
                tracing::warn!(
                    target: "inapp_engine::persistence::database::new",
                    "Store at {} is unusable, recreating it: {}",
                    db_path.display(),
                    e
                );
                Self::discard(&db_path)?;
                Self::open(&db_path).await
            }
        }
    }

    async fn open(db_path: &Path) -> Result<Self, PersistenceError> {
        let db_url = format!("sqlite://{}", db_path.display());

        match Sqlite::database_exists(&db_url).await {
            Ok(true) => {
                tracing::debug!(
                    target: "inapp_engine::persistence::database::open",
                    "DB exists at {}",
                    db_url
                );
            }
            Ok(false) => {
                tracing::debug!(
                    target: "inapp_engine::persistence::database::open",
                    "DB does not exist, creating {}",
                    db_url
                );
                Sqlite::create_database(&db_url).await?;
            }
            Err(e) => {
                tracing::warn!(
                    target: "inapp_engine::persistence::database::open",
                    "Could not check if database exists: {:?}, attempting to create",
                    e
                );
                Sqlite::create_database(&db_url).await?;
            }
        }

        // The pool retries failed connections until its acquire timeout, so
        // an unreadable file is caught on a single connection first.
        Self::check_integrity(&db_url).await?;

        let pool = Self::create_connection_pool(&db_url).await?;
        if let Err(e) = MIGRATOR.run(&pool).await {
            pool.close().await;
            return Err(e.into());
        }

        Ok(Self {
            pool,
            path: db_path.to_path_buf(),
        })
    }

    async fn check_integrity(db_url: &str) -> Result<(), PersistenceError> {
        let mut conn = SqliteConnection::connect(&format!("{db_url}?mode=rwc")).await?;
        let status: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&mut conn)
            .await?;
        conn.close().await?;
        if status != "ok" {
            return Err(PersistenceError::Corrupt(status));
        }
        Ok(())
    }

    /// Removes the database file and its WAL side files, ignoring any that
    /// do not exist.
    fn discard(db_path: &Path) -> Result<(), PersistenceError> {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = db_path.as_os_str().to_os_string();
            path.push(suffix);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Uses [`DEFAULT_DB_NAME`] inside `data_dir`.
    pub async fn in_dir(data_dir: &Path) -> Result<Self, PersistenceError> {
        Self::new(data_dir.join(DEFAULT_DB_NAME)).await
    }

    async fn create_connection_pool(db_url: &str) -> Result<SqlitePool, PersistenceError> {
        let pool = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS))
            .max_connections(DB_MAX_CONNECTIONS)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    let conn = &mut *conn;
                    sqlx::query("PRAGMA journal_mode=WAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query(&format!("PRAGMA busy_timeout={DB_BUSY_TIMEOUT_MS}"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("{db_url}?mode=rwc"))
            .await?;
        Ok(pool)
    }

    async fn fetch_rows(&self) -> Result<Vec<StoredMessageRow>, PersistenceError> {
        let rows = sqlx::query_as::<_, StoredMessageRow>(
            "SELECT message_id, schema_version, record, updated_at
             FROM inapp_messages
             ORDER BY position ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl Persister for SqlitePersister {
    async fn load(&self) -> Vec<Message> {
        match self.fetch_rows().await {
            Ok(rows) => rows
                .into_iter()
                .filter_map(StoredMessageRow::into_message)
                .collect(),
            Err(e) => {
                tracing::warn!(
                    target: "inapp_engine::persistence::database::load",
                    "Could not load stored messages from {}: {}",
                    self.path.display(),
                    e
                );
                Vec::new()
            }
        }
    }

    async fn save(&self, messages: &[Message]) -> Result<(), PersistenceError> {
        let updated_at = Utc::now().timestamp_millis();
        let mut txn = self.pool.begin().await?;

        sqlx::query("DELETE FROM inapp_messages")
            .execute(&mut *txn)
            .await?;

        for (position, message) in messages.iter().enumerate() {
            let record = serde_json::to_string(&encode_message(message))?;
            sqlx::query(
                "INSERT OR REPLACE INTO inapp_messages (message_id, position, schema_version, record, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&message.id)
            .bind(position as i64)
            .bind(SCHEMA_VERSION)
            .bind(record)
            .bind(updated_at)
            .execute(&mut *txn)
            .await?;
        }

        txn.commit().await?;

        tracing::debug!(
            target: "inapp_engine::persistence::database::save",
            "Saved {} messages to {}",
            messages.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM inapp_messages")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
