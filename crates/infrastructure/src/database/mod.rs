pub mod mapping;
pub mod migrations;
pub mod sqlite;

pub use migrations::run_migrations;

use anyhow::{Context, Result};
use jobsched_config::DatabaseConfig;
use jobsched_domain::Repositories;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 创建连接池（外键约束 + WAL）并运行迁移
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("创建SQLite数据库连接池: {}", config.url);

        let connect_options = SqliteConnectOptions::from_str(&config.url)
            .context("解析数据库URL失败")?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            // 多连接并发写入时等待写锁而不是立即返回 SQLITE_BUSY
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect_with(connect_options)
            .await
            .context("创建数据库连接池失败")?;

        let manager = Self { pool };
        manager.migrate().await?;
        info!("数据库连接池创建完成");
        Ok(manager)
    }

    /// 单连接的内存数据库
    pub async fn in_memory() -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("解析数据库URL失败")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context("创建内存数据库失败")?;

        let manager = Self { pool };
        manager.migrate().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        run_migrations(&self.pool)
            .await
            .context("运行数据库迁移失败")
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn repositories(&self) -> Repositories {
        sqlite::repositories(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
