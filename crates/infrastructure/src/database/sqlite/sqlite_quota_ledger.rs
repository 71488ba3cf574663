use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use publisher_domain::{
    ConfirmReceipt, EventPublisher, NotifyEvent, QuotaBalance, QuotaInfo, QuotaLedger, QuotaType,
    ReleaseReceipt, Reservation, ReservationStatus, ReserveReceipt, ReserveRequest, UserEvent,
};
use publisher_errors::{PublishError, PublishResult};
use serde_json::{json, Value};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::db_timestamp;
use crate::error_handling::{RepositoryOperation, RepositoryResultExt};

const RESERVATION_COLUMNS: &str = "id, user_id, quota_type, amount, status, client_id, task_info, \
     created_at, expires_at, confirmed_at, released_at";

/// 两阶段配额账本
///
/// 写操作在一把异步锁内开启事务，等价于对配额行加 `FOR UPDATE`
pub struct SqliteQuotaLedger {
    pool: SqlitePool,
    events: Arc<dyn EventPublisher>,
    reservation_ttl: Duration,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteQuotaLedger {
    pub fn new(pool: SqlitePool, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            pool,
            events,
            reservation_ttl: Duration::seconds(600),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_reservation_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.reservation_ttl = Duration::seconds(ttl.as_secs() as i64);
        self
    }

    pub fn with_write_lock(mut self, write_lock: Arc<Mutex<()>>) -> Self {
        self.write_lock = write_lock;
        self
    }

    fn row_to_reservation(row: &sqlx::sqlite::SqliteRow) -> PublishResult<Reservation> {
        let quota_type: String = row.try_get("quota_type")?;
        let task_info: String = row.try_get("task_info")?;
        Ok(Reservation {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            quota_type: quota_type.parse()?,
            amount: row.try_get("amount")?,
            status: row.try_get("status")?,
            client_id: row.try_get("client_id")?,
            task_info: serde_json::from_str(&task_info)?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            confirmed_at: row.try_get("confirmed_at")?,
            released_at: row.try_get("released_at")?,
        })
    }

    /// 计算账面：预留只统计未过期的 reserved 记录
    async fn balance(
        conn: &mut SqliteConnection,
        user_id: i64,
        quota_type: QuotaType,
        now: DateTime<Utc>,
    ) -> PublishResult<QuotaBalance> {
        let account = sqlx::query(
            "SELECT quota_limit, used FROM user_quotas WHERE user_id = ? AND quota_type = ?",
        )
        .bind(user_id)
        .bind(quota_type.as_str())
        .fetch_optional(&mut *conn)
        .await
        .with_operation(RepositoryOperation::Read, "用户配额")?;

        let (limit, used) = match account {
            Some(row) => (row.try_get::<i64, _>("quota_limit")?, row.try_get::<i64, _>("used")?),
            None => (0, 0),
        };

        let reserved: i64 = sqlx::query(
            "SELECT COALESCE(SUM(amount), 0) AS reserved FROM quota_reservations \
             WHERE user_id = ? AND quota_type = ? AND status = 'reserved' AND expires_at > ?",
        )
        .bind(user_id)
        .bind(quota_type.as_str())
        .bind(db_timestamp(now))
        .fetch_one(&mut *conn)
        .await
        .with_operation(RepositoryOperation::Query, "预留汇总")?
        .try_get("reserved")?;

        Ok(QuotaBalance::new(limit, used, reserved))
    }

    async fn fetch_open_reservation(
        conn: &mut SqliteConnection,
        reservation_id: &str,
    ) -> PublishResult<Reservation> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM quota_reservations WHERE id = ? AND status = 'reserved'"
        ))
        .bind(reservation_id)
        .fetch_optional(&mut *conn)
        .await
        .with_operation(RepositoryOperation::Read, "预留记录")?;

        match row {
            Some(row) => Self::row_to_reservation(&row),
            None => Err(PublishError::reservation_not_found(reservation_id)),
        }
    }

    /// 将过期仍为 reserved 的预留标记为 expired，返回处理条数
    #[instrument(skip(self))]
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> PublishResult<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE quota_reservations SET status = 'expired' \
             WHERE status = 'reserved' AND expires_at <= ?",
        )
        .bind(db_timestamp(now))
        .execute(&self.pool)
        .await
        .with_operation(RepositoryOperation::BatchUpdate, "过期预留")?;

        let expired = result.rows_affected();
        if expired > 0 {
            info!("回收过期预留 {} 条", expired);
        }
        Ok(expired)
    }

    /// 已有的预留记录（含已关闭），供排查与测试
    pub async fn get_reservation(&self, reservation_id: &str) -> PublishResult<Reservation> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM quota_reservations WHERE id = ?"
        ))
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await
        .with_operation(RepositoryOperation::Read, "预留记录")?;

        match row {
            Some(row) => Self::row_to_reservation(&row),
            None => Err(PublishError::reservation_not_found(reservation_id)),
        }
    }
}

fn merge_task_info(info: &mut Value, key: &str, value: Value) {
    if !info.is_object() {
        *info = json!({});
    }
    if let Some(map) = info.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

#[async_trait]
impl QuotaLedger for SqliteQuotaLedger {
    #[instrument(skip(self, request), fields(
        user_id = request.user_id,
        quota_type = %request.quota_type,
        amount = request.amount,
    ))]
    async fn reserve(&self, request: &ReserveRequest) -> PublishResult<ReserveReceipt> {
        let quota_type: QuotaType = request.quota_type.parse()?;
        if request.amount <= 0 {
            return Err(PublishError::invalid_params("预扣减数量必须大于 0"));
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .with_operation(RepositoryOperation::Create, "预留事务")?;
        let now = Utc::now();

        let balance = Self::balance(&mut tx, request.user_id, quota_type, now).await?;
        if balance.available < request.amount {
            warn!(
                "配额不足: 用户 {} {} 需要 {}，剩余 {}",
                request.user_id, quota_type, request.amount, balance.available
            );
            return Err(PublishError::InsufficientQuota {
                quota_type: quota_type.to_string(),
                requested: request.amount,
                available: balance.available,
            });
        }

        let reservation_id = Uuid::new_v4().to_string();
        let expires_at = now + self.reservation_ttl;
        let task_info = request.task_info.clone().unwrap_or_else(|| json!({}));

        sqlx::query(
            "INSERT INTO quota_reservations \
             (id, user_id, quota_type, amount, status, client_id, task_info, created_at, expires_at) \
             VALUES (?, ?, ?, ?, 'reserved', ?, ?, ?, ?)",
        )
        .bind(&reservation_id)
        .bind(request.user_id)
        .bind(quota_type.as_str())
        .bind(request.amount)
        .bind(&request.client_id)
        .bind(task_info.to_string())
        .bind(db_timestamp(now))
        .bind(db_timestamp(expires_at))
        .execute(&mut *tx)
        .await
        .with_operation(RepositoryOperation::Create, "预留记录")?;

        tx.commit()
            .await
            .with_operation(RepositoryOperation::Create, "预留事务")?;

        debug!("创建预留 {}，过期时间 {}", reservation_id, expires_at);
        Ok(ReserveReceipt {
            reservation_id,
            expires_at,
            remaining_quota: balance.available - request.amount,
        })
    }

    #[instrument(skip(self, result))]
    async fn confirm(
        &self,
        reservation_id: &str,
        result: Option<Value>,
    ) -> PublishResult<ConfirmReceipt> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .with_operation(RepositoryOperation::Update, "确认事务")?;
        let now = Utc::now();

        let reservation = Self::fetch_open_reservation(&mut tx, reservation_id).await?;

        if reservation.is_expired_at(now) {
            sqlx::query("UPDATE quota_reservations SET status = 'expired' WHERE id = ?")
                .bind(reservation_id)
                .execute(&mut *tx)
                .await
                .with_operation(RepositoryOperation::Update, "预留记录")?;
            tx.commit()
                .await
                .with_operation(RepositoryOperation::Update, "确认事务")?;
            warn!("预留 {} 已过期，无法确认", reservation_id);
            return Err(PublishError::ReservationExpired {
                id: reservation_id.to_string(),
            });
        }

        let mut task_info = reservation.task_info.clone();
        if let Some(result) = result {
            merge_task_info(&mut task_info, "confirmResult", result);
        }

        sqlx::query(
            "UPDATE quota_reservations SET status = 'confirmed', confirmed_at = ?, task_info = ? \
             WHERE id = ? AND status = 'reserved'",
        )
        .bind(db_timestamp(now))
        .bind(task_info.to_string())
        .bind(reservation_id)
        .execute(&mut *tx)
        .await
        .with_operation(RepositoryOperation::Update, "预留记录")?;

        let debit = sqlx::query(
            "UPDATE user_quotas SET used = used + ? \
             WHERE user_id = ? AND quota_type = ? AND used + ? <= quota_limit",
        )
        .bind(reservation.amount)
        .bind(reservation.user_id)
        .bind(reservation.quota_type.as_str())
        .bind(reservation.amount)
        .execute(&mut *tx)
        .await
        .with_operation(RepositoryOperation::Update, "用户配额")?;

        if debit.rows_affected() == 0 {
            tx.rollback()
                .await
                .with_operation(RepositoryOperation::Update, "确认事务")?;
            warn!("预留 {} 扣减配额失败，已回滚", reservation_id);
            return Err(PublishError::ConsumeFailed(format!(
                "用户 {} 的 {} 配额无法扣减 {}",
                reservation.user_id, reservation.quota_type, reservation.amount
            )));
        }

        let balance =
            Self::balance(&mut tx, reservation.user_id, reservation.quota_type, now).await?;
        tx.commit()
            .await
            .with_operation(RepositoryOperation::Update, "确认事务")?;

        info!(
            "确认预留 {}: 用户 {} 消耗 {} {}",
            reservation_id, reservation.user_id, reservation.amount, reservation.quota_type
        );
        self.events.publish(UserEvent::new(
            reservation.user_id,
            NotifyEvent::QuotaReservationConfirmed {
                reservation_id: reservation_id.to_string(),
                quota_type: reservation.quota_type,
                consumed: reservation.amount,
            },
        ));

        Ok(ConfirmReceipt {
            consumed: reservation.amount,
            remaining_quota: balance.available,
        })
    }

    #[instrument(skip(self))]
    async fn release(
        &self,
        reservation_id: &str,
        reason: Option<&str>,
        error_code: Option<&str>,
    ) -> PublishResult<ReleaseReceipt> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .with_operation(RepositoryOperation::Update, "释放事务")?;
        let now = Utc::now();

        let reservation = Self::fetch_open_reservation(&mut tx, reservation_id).await?;

        let mut task_info = reservation.task_info.clone();
        if let Some(reason) = reason {
            merge_task_info(&mut task_info, "releaseReason", json!(reason));
        }
        if let Some(code) = error_code {
            merge_task_info(&mut task_info, "releaseErrorCode", json!(code));
        }

        sqlx::query(
            "UPDATE quota_reservations SET status = 'released', released_at = ?, task_info = ? \
             WHERE id = ? AND status = 'reserved'",
        )
        .bind(db_timestamp(now))
        .bind(task_info.to_string())
        .bind(reservation_id)
        .execute(&mut *tx)
        .await
        .with_operation(RepositoryOperation::Update, "预留记录")?;

        let balance =
            Self::balance(&mut tx, reservation.user_id, reservation.quota_type, now).await?;
        tx.commit()
            .await
            .with_operation(RepositoryOperation::Update, "释放事务")?;

        info!(
            "释放预留 {}: 用户 {} 归还 {} {}，原因: {:?}",
            reservation_id, reservation.user_id, reservation.amount, reservation.quota_type, reason
        );
        self.events.publish(UserEvent::new(
            reservation.user_id,
            NotifyEvent::QuotaReservationReleased {
                reservation_id: reservation_id.to_string(),
                quota_type: reservation.quota_type,
                released: reservation.amount,
                reason: reason.map(str::to_string),
            },
        ));

        Ok(ReleaseReceipt {
            released: reservation.amount,
            remaining_quota: balance.available,
        })
    }

    #[instrument(skip(self))]
    async fn quota_info(&self, user_id: i64) -> PublishResult<QuotaInfo> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .with_operation(RepositoryOperation::Read, "用户配额")?;
        let now = Utc::now();

        let mut quotas = BTreeMap::new();
        for quota_type in QuotaType::ALL {
            let balance = Self::balance(&mut conn, user_id, quota_type, now).await?;
            quotas.insert(quota_type.as_str().to_string(), balance);
        }

        Ok(QuotaInfo { user_id, quotas })
    }

    #[instrument(skip(self))]
    async fn user_reservations(
        &self,
        user_id: i64,
        status: Option<ReservationStatus>,
    ) -> PublishResult<Vec<Reservation>> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM quota_reservations \
             WHERE user_id = ? AND (? IS NULL OR status = ?) \
             ORDER BY created_at DESC LIMIT 100"
        ))
        .bind(user_id)
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .with_operation(RepositoryOperation::Query, "预留记录")?;

        rows.iter().map(Self::row_to_reservation).collect()
    }

    #[instrument(skip(self))]
    async fn set_quota_limit(&self, user_id: i64, quota_type: &str, limit: i64) -> PublishResult<()> {
        let quota_type: QuotaType = quota_type.parse()?;
        if limit < 0 {
            return Err(PublishError::invalid_params("配额上限不能为负数"));
        }

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO user_quotas (user_id, quota_type, quota_limit, used) VALUES (?, ?, ?, 0) \
             ON CONFLICT(user_id, quota_type) DO UPDATE SET quota_limit = excluded.quota_limit",
        )
        .bind(user_id)
        .bind(quota_type.as_str())
        .bind(limit)
        .execute(&self.pool)
        .await
        .with_operation(RepositoryOperation::Update, "用户配额")?;

        debug!("设置用户 {} 的 {} 配额上限为 {}", user_id, quota_type, limit);
        Ok(())
    }
}
