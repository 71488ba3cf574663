use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use publisher_config::DatabaseConfig;
use publisher_domain::EventPublisher;
use publisher_errors::{PublishError, PublishResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::migrations::MIGRATIONS;
use super::sqlite::{SqliteQuotaLedger, SqliteTaskRepository};

/// SQLite 连接池与仓储工厂
///
/// 账本与任务仓储共用一把写锁，保证同一时刻只有一个写事务
pub struct DatabaseManager {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> PublishResult<Self> {
        info!("创建SQLite数据库连接池: {}", config.url);

        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await?;

        let manager = Self::from_pool(pool);
        manager.run_migrations().await?;
        Ok(manager)
    }

    /// 单连接内存库，连接不会被回收
    pub async fn in_memory() -> PublishResult<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;

        let manager = Self::from_pool(pool);
        manager.run_migrations().await?;
        Ok(manager)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn run_migrations(&self) -> PublishResult<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| PublishError::database_error(format!("数据库迁移失败: {e}")))?;
        }
        debug!("数据库迁移完成，共 {} 条语句", MIGRATIONS.len());
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> PublishResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    pub fn quota_ledger(&self, events: Arc<dyn EventPublisher>) -> SqliteQuotaLedger {
        SqliteQuotaLedger::new(self.pool.clone(), events).with_write_lock(self.write_lock.clone())
    }

    pub fn task_repository(&self, events: Arc<dyn EventPublisher>) -> SqliteTaskRepository {
        SqliteTaskRepository::new(self.pool.clone(), events)
            .with_write_lock(self.write_lock.clone())
    }
}
