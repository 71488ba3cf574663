use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use publisher_api::{create_app, AppState};
use publisher_config::ApiConfig;
use publisher_domain::{
    ArticleSnapshot, LogLevel, NewTask, QuotaLedger, QuotaType, ReservationStatus,
    ReserveRequest, TaskFilter, TaskRepository, TaskStatus,
};
use publisher_errors::PublishError;
use publisher_infrastructure::{BroadcastEventBus, DatabaseManager};
use publisher_worker::RemoteClient;
use serde_json::json;

struct TestServer {
    client: RemoteClient,
    _manager: DatabaseManager,
}

async fn start_server() -> Result<TestServer> {
    let manager = DatabaseManager::in_memory().await?;
    let events = Arc::new(BroadcastEventBus::default());
    let ledger = Arc::new(manager.quota_ledger(events.clone()));
    let tasks = Arc::new(manager.task_repository(events.clone()));
    let app = create_app(AppState::new(ledger, tasks, events), &ApiConfig::default());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    let client = RemoteClient::new(
        &format!("http://{addr}/"),
        "agent-1".to_string(),
        Duration::from_secs(5),
    )?;
    Ok(TestServer {
        client,
        _manager: manager,
    })
}

fn new_task(batch_id: &str, order: i32) -> NewTask {
    NewTask::new(
        7,
        3,
        "zhihu",
        ArticleSnapshot {
            title: format!("标题 {order}"),
            content: "正文".to_string(),
            keyword: Some("rust".to_string()),
        },
    )
    .in_batch(batch_id, order)
}

#[tokio::test]
async fn test_quota_round_trip_over_http() -> Result<()> {
    let server = start_server().await?;
    let client = &server.client;
    client.set_quota_limit(7, "publish", 2).await?;

    let receipt = client
        .reserve(&ReserveRequest {
            user_id: 7,
            quota_type: "publish".to_string(),
            amount: 1,
            client_id: None,
            task_info: Some(json!({ "taskId": 1 })),
        })
        .await?;
    assert_eq!(receipt.remaining_quota, 1);

    let reservations = client
        .user_reservations(7, Some(ReservationStatus::Reserved))
        .await?;
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].client_id.as_deref(), Some("agent-1"));

    let confirmed = client
        .confirm(&receipt.reservation_id, Some(json!({ "status": "success" })))
        .await?;
    assert_eq!(confirmed.consumed, 1);

    let err = client
        .confirm(&receipt.reservation_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::ReservationNotFound { .. }));

    let info = client.quota_info(7).await?;
    assert_eq!(info.balance(QuotaType::Publish).used, 1);
    assert_eq!(info.balance(QuotaType::Publish).available, 1);
    Ok(())
}

#[tokio::test]
async fn test_remote_errors_are_rebuilt() -> Result<()> {
    let server = start_server().await?;
    let client = &server.client;

    let request = ReserveRequest {
        user_id: 7,
        quota_type: "publish".to_string(),
        amount: 1,
        client_id: None,
        task_info: None,
    };
    match client.reserve(&request).await.unwrap_err() {
        PublishError::InsufficientQuota {
            quota_type,
            requested,
            available,
        } => {
            assert_eq!(quota_type, "publish");
            assert_eq!(requested, 1);
            assert_eq!(available, 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let invalid = ReserveRequest {
        quota_type: "vip_minutes".to_string(),
        ..request
    };
    let err = client.reserve(&invalid).await.unwrap_err();
    assert!(matches!(err, PublishError::InvalidQuotaType(_)));
    assert!(err.is_fatal());

    let err = client.get_task(404).await.unwrap_err();
    assert!(matches!(err, PublishError::TaskNotFound { id: 404 }));
    Ok(())
}

#[tokio::test]
async fn test_task_lifecycle_over_http() -> Result<()> {
    let server = start_server().await?;
    let client = &server.client;

    let first = client.create_task(&new_task("b-1", 1)).await?;
    let second = client.create_task(&new_task("b-1", 2)).await?;
    assert_eq!(first.status, TaskStatus::Pending);

    let task = client.get_task_for_execution(first.id).await?;
    assert_eq!(task.snapshot.title, "标题 1");
    assert_eq!(task.snapshot.keyword.as_deref(), Some("rust"));

    client
        .update_status(first.id, TaskStatus::Running, None)
        .await?;
    let err = client
        .update_status(first.id, TaskStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::InvalidStateTransition { .. }));

    assert_eq!(client.increment_retry_count(first.id).await?, 1);
    client
        .update_status(first.id, TaskStatus::Pending, Some("执行失败，将自动重试 (1/3)"))
        .await?;
    client
        .add_log(first.id, LogLevel::Warning, "执行失败", Some(json!({ "step": "login" })))
        .await?;
    assert_eq!(client.get_logs(first.id).await?.len(), 1);

    let pending = client
        .list_tasks(&TaskFilter {
            status: Some(TaskStatus::Pending),
            batch_id: Some("b-1".to_string()),
            ..Default::default()
        })
        .await?;
    assert_eq!(pending.len(), 2);

    let batch = client.list_by_batch("b-1").await?;
    assert_eq!(
        batch.iter().map(|t| t.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );

    let stopped = client.stop_batch("b-1").await?;
    assert_eq!(stopped.cancelled_count, 2);
    let info = client.batch_info("b-1").await?;
    assert_eq!(info.cancelled_tasks, 2);
    assert_eq!(info.pending_tasks, 0);

    assert_eq!(client.delete_batch("b-1").await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_server_is_network_error() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let client = RemoteClient::new(
        &format!("http://{addr}"),
        "agent-1".to_string(),
        Duration::from_secs(2),
    )?;
    let err = client.get_task(1).await.unwrap_err();
    assert!(matches!(err, PublishError::Network(_) | PublishError::Timeout(_)));
    assert!(err.is_retryable());
    Ok(())
}
