//! 数据库连接管理

use crate::queries::DatabaseQueries;
use pacs_core::{PacsError, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
/// 默认最大连接数
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// 连接参数
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl DatabaseOptions {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

/// 数据库连接池
///
/// 每个连接都以 WAL 模式打开并启用外键，读取方不会被导入写事务阻塞。
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// 打开 (必要时创建) 索引库并建表
    pub async fn open(options: &DatabaseOptions) -> Result<Self> {
        if let Some(parent) = options.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(&options.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect_options)
            .await
            .map_err(|e| PacsError::Database(format!("无法打开索引库 {:?}: {}", options.path, e)))?;

        let database = Self { pool };
        DatabaseQueries::new(&database).create_tables().await?;

        info!("索引库已打开: {:?}", options.path);
        Ok(database)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_file_and_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.db");
        let database = DatabasePool::open(&DatabaseOptions::new(&path)).await.unwrap();
        assert!(path.exists());

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(database.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(database.pool())
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[tokio::test]
    async fn test_open_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let options = DatabaseOptions::new(dir.path().join("index.db"));
        let first = DatabasePool::open(&options).await.unwrap();
        first.close().await;
        DatabasePool::open(&options).await.unwrap();
    }
}
