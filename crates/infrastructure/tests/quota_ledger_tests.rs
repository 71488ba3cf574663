use anyhow::Result;
use chrono::Utc;
use publisher_domain::{QuotaLedger, QuotaType, ReservationStatus, ReserveRequest};
use publisher_errors::PublishError;
use serde_json::json;

use database_test_utils::TestDatabase;

fn publish_request(user_id: i64) -> ReserveRequest {
    ReserveRequest {
        user_id,
        quota_type: "publish".to_string(),
        amount: 1,
        client_id: Some("agent-1".to_string()),
        task_info: Some(json!({ "taskId": 1 })),
    }
}

#[tokio::test]
async fn test_reserve_confirm_happy_path() -> Result<()> {
    let db = TestDatabase::new().await?;
    db.ledger.set_quota_limit(7, "publish", 3).await?;

    let receipt = db.ledger.reserve(&publish_request(7)).await?;
    assert_eq!(receipt.remaining_quota, 2);
    assert!(receipt.expires_at > Utc::now());

    let info = db.ledger.quota_info(7).await?;
    let balance = info.balance(QuotaType::Publish);
    assert_eq!(balance.reserved, 1);
    assert_eq!(balance.available, 2);

    let confirmed = db
        .ledger
        .confirm(&receipt.reservation_id, Some(json!({ "url": "https://example.com/p/1" })))
        .await?;
    assert_eq!(confirmed.consumed, 1);
    assert_eq!(confirmed.remaining_quota, 2);

    let balance = db.ledger.quota_info(7).await?.balance(QuotaType::Publish);
    assert_eq!(balance.used, 1);
    assert_eq!(balance.reserved, 0);
    assert_eq!(balance.available, 2);

    let reservation = db.ledger.get_reservation(&receipt.reservation_id).await?;
    assert_eq!(reservation.status, ReservationStatus::Confirmed);
    assert!(reservation.confirmed_at.is_some());
    assert_eq!(reservation.task_info["taskId"], 1);
    assert_eq!(reservation.task_info["confirmResult"]["url"], "https://example.com/p/1");

    assert_eq!(db.events.event_types(), vec!["quota_reservation_confirmed"]);
    assert_eq!(db.events.events()[0].user_id, 7);
    Ok(())
}

#[tokio::test]
async fn test_closed_reservation_cannot_be_closed_again() -> Result<()> {
    let db = TestDatabase::new().await?;
    db.ledger.set_quota_limit(7, "publish", 3).await?;
    let receipt = db.ledger.reserve(&publish_request(7)).await?;
    db.ledger.confirm(&receipt.reservation_id, None).await?;

    let again = db.ledger.confirm(&receipt.reservation_id, None).await;
    assert!(matches!(again, Err(PublishError::ReservationNotFound { .. })));

    let release = db.ledger.release(&receipt.reservation_id, None, None).await;
    assert!(matches!(release, Err(PublishError::ReservationNotFound { .. })));

    let balance = db.ledger.quota_info(7).await?.balance(QuotaType::Publish);
    assert_eq!(balance.used, 1);
    assert_eq!(balance.available, 2);
    Ok(())
}

#[tokio::test]
async fn test_expired_reservation_is_rejected_and_returned() -> Result<()> {
    let db = TestDatabase::new().await?;
    db.ledger.set_quota_limit(7, "publish", 3).await?;
    let receipt = db.ledger.reserve(&publish_request(7)).await?;
    db.backdate("quota_reservations", "expires_at", "id", &receipt.reservation_id)
        .await?;

    let balance = db.ledger.quota_info(7).await?.balance(QuotaType::Publish);
    assert_eq!(balance.available, 3);

    let result = db.ledger.confirm(&receipt.reservation_id, None).await;
    assert!(matches!(result, Err(PublishError::ReservationExpired { .. })));

    let reservation = db.ledger.get_reservation(&receipt.reservation_id).await?;
    assert_eq!(reservation.status, ReservationStatus::Expired);

    let balance = db.ledger.quota_info(7).await?.balance(QuotaType::Publish);
    assert_eq!(balance.used, 0);
    assert_eq!(balance.available, 3);

    let release = db.ledger.release(&receipt.reservation_id, None, None).await;
    assert!(matches!(release, Err(PublishError::ReservationNotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn test_insufficient_and_invalid_quota() -> Result<()> {
    let db = TestDatabase::new().await?;
    db.ledger.set_quota_limit(7, "publish", 1).await?;
    db.ledger.reserve(&publish_request(7)).await?;

    match db.ledger.reserve(&publish_request(7)).await {
        Err(PublishError::InsufficientQuota {
            requested,
            available,
            ..
        }) => {
            assert_eq!(requested, 1);
            assert_eq!(available, 0);
        }
        other => panic!("expected insufficient quota, got {other:?}"),
    }

    let mut request = publish_request(7);
    request.quota_type = "video_minutes".to_string();
    let err = db.ledger.reserve(&request).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_QUOTA_TYPE");

    // 未开通的用户没有额度
    let err = db.ledger.reserve(&publish_request(8)).await.unwrap_err();
    assert_eq!(err.error_code(), "INSUFFICIENT_QUOTA");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reserves_never_oversell() -> Result<()> {
    let db = TestDatabase::new().await?;
    db.ledger.set_quota_limit(7, "publish", 3).await?;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = db.ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.reserve(&publish_request(7)).await
        }));
    }

    let mut succeeded = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => succeeded += 1,
            Err(PublishError::InsufficientQuota { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(succeeded, 3);
    assert_eq!(rejected, 7);

    let balance = db.ledger.quota_info(7).await?.balance(QuotaType::Publish);
    assert_eq!(balance.reserved, 3);
    assert_eq!(balance.available, 0);
    Ok(())
}

#[tokio::test]
async fn test_release_merges_reason_and_notifies() -> Result<()> {
    let db = TestDatabase::new().await?;
    db.ledger.set_quota_limit(7, "publish", 2).await?;
    let receipt = db.ledger.reserve(&publish_request(7)).await?;

    let released = db
        .ledger
        .release(&receipt.reservation_id, Some("执行失败"), Some("EXECUTION_FAILED"))
        .await?;
    assert_eq!(released.released, 1);
    assert_eq!(released.remaining_quota, 2);

    let reservation = db.ledger.get_reservation(&receipt.reservation_id).await?;
    assert_eq!(reservation.status, ReservationStatus::Released);
    assert_eq!(reservation.task_info["releaseReason"], "执行失败");
    assert_eq!(reservation.task_info["releaseErrorCode"], "EXECUTION_FAILED");

    assert_eq!(db.events.event_types(), vec!["quota_reservation_released"]);
    Ok(())
}

#[tokio::test]
async fn test_failed_debit_rolls_back_confirm() -> Result<()> {
    let db = TestDatabase::new().await?;
    db.ledger.set_quota_limit(7, "publish", 2).await?;
    let receipt = db.ledger.reserve(&publish_request(7)).await?;

    // 预留后上限被下调，扣减不能越过上限
    db.ledger.set_quota_limit(7, "publish", 0).await?;

    let err = db.ledger.confirm(&receipt.reservation_id, None).await.unwrap_err();
    assert_eq!(err.error_code(), "CONSUME_FAILED");

    let reservation = db.ledger.get_reservation(&receipt.reservation_id).await?;
    assert_eq!(reservation.status, ReservationStatus::Reserved);
    assert!(db.events.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_expire_overdue_closes_stale_reservations() -> Result<()> {
    let db = TestDatabase::new().await?;
    db.ledger.set_quota_limit(7, "publish", 3).await?;
    let stale = db.ledger.reserve(&publish_request(7)).await?;
    let fresh = db.ledger.reserve(&publish_request(7)).await?;
    db.backdate("quota_reservations", "expires_at", "id", &stale.reservation_id)
        .await?;

    assert_eq!(db.ledger.expire_overdue(Utc::now()).await?, 1);
    assert_eq!(db.ledger.expire_overdue(Utc::now()).await?, 0);

    let expired = db
        .ledger
        .user_reservations(7, Some(ReservationStatus::Expired))
        .await?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, stale.reservation_id);

    let all = db.ledger.user_reservations(7, None).await?;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, fresh.reservation_id);

    assert!(db.ledger.release(&fresh.reservation_id, None, None).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_quota_info_lists_all_types() -> Result<()> {
    let db = TestDatabase::new().await?;
    db.ledger.set_quota_limit(7, "image_upload", 50).await?;

    let info = db.ledger.quota_info(7).await?;
    assert_eq!(info.quotas.len(), 4);
    assert_eq!(info.balance(QuotaType::ImageUpload).available, 50);
    assert_eq!(info.balance(QuotaType::ArticleGeneration).limit, 0);

    assert!(db.ledger.set_quota_limit(7, "publish", -1).await.is_err());
    assert!(db.ledger.set_quota_limit(7, "bogus", 1).await.is_err());
    Ok(())
}
