mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{make_task, Behavior, MockLauncher, MockQuotaLedger, MockTaskRepository};
use publisher_config::ExecutionConfig;
use publisher_domain::TaskStatus;
use publisher_errors::PublishError;
use publisher_worker::{
    AutomationSession, BackoffPolicy, BackoffQuotaLedger, ExecutionSandbox, TaskOutcome, TaskRunner,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn sandbox(
    tasks: &Arc<MockTaskRepository>,
    ledger: Arc<dyn publisher_domain::QuotaLedger>,
    launcher: &Arc<MockLauncher>,
) -> ExecutionSandbox {
    ExecutionSandbox::new(
        tasks.clone(),
        ledger,
        launcher.clone(),
        ExecutionConfig::default(),
    )
    .with_client_id("test-agent")
}

#[tokio::test(start_paused = true)]
async fn test_success_confirms_reservation() {
    let tasks = MockTaskRepository::with_tasks(vec![make_task(1, None, 0)]);
    let ledger = MockQuotaLedger::new();
    let launcher = MockLauncher::scripted(vec![Behavior::Succeed]);
    let sandbox = sandbox(&tasks, ledger.clone(), &launcher);

    let outcome = sandbox.run_task(1, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Succeeded);
    assert_eq!(tasks.task(1).status, TaskStatus::Success);
    assert_eq!(ledger.calls(), vec!["reserve", "confirm:r-1"]);
    assert!(launcher.session(0).closed.load(Ordering::SeqCst));
    assert!(!launcher.session(0).was_force_closed());
    assert!(tasks.log_messages(1).contains(&"发布成功".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_force_closes_session_before_reporting() {
    let mut task = make_task(1, None, 0);
    task.timeout_minutes = Some(1);
    let tasks = MockTaskRepository::with_tasks(vec![task]);
    let ledger = MockQuotaLedger::new();
    let launcher = MockLauncher::scripted(vec![Behavior::Hang]);
    let sandbox = sandbox(&tasks, ledger.clone(), &launcher);

    let started = Instant::now();
    let outcome = sandbox.run_task(1, CancellationToken::new()).await.unwrap();
    let reported = Instant::now();

    assert_eq!(
        outcome,
        TaskOutcome::RetryScheduled {
            retry_count: 1,
            max_retries: 3
        }
    );

    let session = launcher.session(0);
    let force_closed_at = (*session.force_closed_at.lock().unwrap()).expect("会话未被强制关闭");
    assert!(force_closed_at - started >= Duration::from_secs(60));
    assert!(force_closed_at - started < Duration::from_secs(61));
    assert!(force_closed_at <= reported);
    assert!(!session.closed.load(Ordering::SeqCst));

    let task = tasks.task(1);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert_eq!(
        task.error_message.as_deref(),
        Some("执行超时，将自动重试 (1/3)")
    );
    assert_eq!(ledger.calls(), vec!["reserve", "release:r-1:TIMEOUT"]);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_falls_back_to_config() {
    let tasks = MockTaskRepository::with_tasks(Vec::new());
    let launcher = Arc::new(MockLauncher::default());
    let sandbox = sandbox(&tasks, MockQuotaLedger::new(), &launcher);

    let mut task = make_task(2, None, 0);
    assert_eq!(sandbox.deadline_for(&task), Duration::from_secs(15 * 60));

    task.timeout_minutes = Some(0);
    assert_eq!(sandbox.deadline_for(&task), Duration::from_secs(60));

    task.timeout_minutes = Some(90);
    assert_eq!(sandbox.deadline_for(&task), Duration::from_secs(90 * 60));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_does_not_consume_task_retry() {
    let tasks = MockTaskRepository::with_tasks(vec![make_task(1, None, 0)]);
    let ledger = MockQuotaLedger::new();
    ledger.rate_limit_next_reserves(3);
    let policy = BackoffPolicy {
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
        jitter_factor: 0.0,
        max_attempts: 5,
    };
    let backoff_ledger = Arc::new(BackoffQuotaLedger::new(ledger.clone(), policy));
    let launcher = MockLauncher::scripted(vec![Behavior::Succeed]);
    let sandbox = sandbox(&tasks, backoff_ledger, &launcher);

    let outcome = sandbox.run_task(1, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Succeeded);
    assert_eq!(ledger.count("reserve"), 4);
    let task = tasks.task(1);
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_escapes_and_restores_pending() {
    let tasks = MockTaskRepository::with_tasks(vec![make_task(1, None, 0)]);
    let ledger = MockQuotaLedger::new();
    ledger.rate_limit_next_reserves(1);
    let launcher = Arc::new(MockLauncher::default());
    let sandbox = sandbox(&tasks, ledger.clone(), &launcher);

    let err = sandbox
        .run_task(1, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_rate_limited());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    assert_eq!(launcher.launches(), 0);
    let task = tasks.task(1);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_releases_without_retry_charge() {
    let tasks = MockTaskRepository::with_tasks(vec![make_task(1, None, 0)]);
    let ledger = MockQuotaLedger::new();
    let launcher = MockLauncher::scripted(vec![Behavior::Hang]);
    let sandbox = Arc::new(sandbox(&tasks, ledger.clone(), &launcher));
    let cancel = CancellationToken::new();

    let running = {
        let sandbox = Arc::clone(&sandbox);
        let cancel = cancel.clone();
        tokio::spawn(async move { sandbox.run_task(1, cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(tasks.task(1).status, TaskStatus::Running);

    cancel.cancel();
    let outcome = running.await.unwrap().unwrap();

    assert_eq!(outcome, TaskOutcome::Cancelled);
    let task = tasks.task(1);
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.retry_count, 0);
    assert_eq!(ledger.calls(), vec!["reserve", "release:r-1:CANCELLED"]);
    assert!(!launcher.session(0).is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_failures_until_retries_exhausted() {
    let mut task = make_task(1, None, 0);
    task.max_retries = 2;
    let tasks = MockTaskRepository::with_tasks(vec![task]);
    let ledger = MockQuotaLedger::new();
    let launcher = MockLauncher::scripted(vec![
        Behavior::Fail("找不到发布按钮".to_string()),
        Behavior::Fail("找不到发布按钮".to_string()),
    ]);
    let sandbox = sandbox(&tasks, ledger.clone(), &launcher);

    let first = sandbox.run_task(1, CancellationToken::new()).await.unwrap();
    assert_eq!(
        first,
        TaskOutcome::RetryScheduled {
            retry_count: 1,
            max_retries: 2
        }
    );
    assert_eq!(
        tasks.task(1).error_message.as_deref(),
        Some("执行失败，将自动重试 (1/2)")
    );

    let second = sandbox.run_task(1, CancellationToken::new()).await.unwrap();
    match second {
        TaskOutcome::Failed { message } => {
            assert!(message.starts_with("重试次数已用完"));
            assert!(message.contains("找不到发布按钮"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let task = tasks.task(1);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(ledger.count("release"), 2);
    assert_eq!(ledger.count("confirm"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_quota_fails_without_retry() {
    let tasks = MockTaskRepository::with_tasks(vec![make_task(1, None, 0)]);
    let ledger = MockQuotaLedger::new();
    ledger.exhaust_quota();
    let launcher = Arc::new(MockLauncher::default());
    let sandbox = sandbox(&tasks, ledger.clone(), &launcher);

    let outcome = sandbox.run_task(1, CancellationToken::new()).await.unwrap();

    assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    assert_eq!(launcher.launches(), 0);
    let task = tasks.task(1);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_task_is_skipped() {
    let mut task = make_task(1, None, 0);
    task.status = TaskStatus::Success;
    let tasks = MockTaskRepository::with_tasks(vec![task]);
    let ledger = MockQuotaLedger::new();
    let launcher = Arc::new(MockLauncher::default());
    let sandbox = sandbox(&tasks, ledger.clone(), &launcher);

    let outcome = sandbox.run_task(1, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Skipped(TaskStatus::Success));
    assert!(ledger.calls().is_empty());
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_running_task_is_not_started_twice() {
    let mut task = make_task(1, None, 0);
    task.status = TaskStatus::Running;
    let tasks = MockTaskRepository::with_tasks(vec![task]);
    let ledger = MockQuotaLedger::new();
    let launcher = Arc::new(MockLauncher::default());
    let sandbox = sandbox(&tasks, ledger.clone(), &launcher);

    let outcome = sandbox.run_task(1, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Skipped(TaskStatus::Running));
    assert!(ledger.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_task_is_an_error() {
    let tasks = MockTaskRepository::with_tasks(Vec::new());
    let launcher = Arc::new(MockLauncher::default());
    let sandbox = sandbox(&tasks, MockQuotaLedger::new(), &launcher);

    let err = sandbox
        .run_task(404, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::TaskNotFound { id: 404 }));
}

#[tokio::test(start_paused = true)]
async fn test_failed_graceful_close_falls_back_to_force_close() {
    let tasks = MockTaskRepository::with_tasks(vec![make_task(1, None, 0)]);
    let ledger = MockQuotaLedger::new();
    let launcher = MockLauncher::scripted(vec![Behavior::CloseFails]);
    let sandbox = sandbox(&tasks, ledger.clone(), &launcher);

    let outcome = sandbox.run_task(1, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Succeeded);
    let session = launcher.session(0);
    assert!(!session.closed.load(Ordering::SeqCst));
    assert!(session.was_force_closed());
    assert!(!session.is_alive());
    assert_eq!(ledger.calls(), vec!["reserve", "confirm:r-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_graceful_close_is_bounded() {
    let tasks = MockTaskRepository::with_tasks(vec![make_task(1, None, 0)]);
    let ledger = MockQuotaLedger::new();
    let launcher = MockLauncher::scripted(vec![Behavior::CloseHangs]);
    let sandbox = sandbox(&tasks, ledger.clone(), &launcher);

    let started = Instant::now();
    let outcome = sandbox.run_task(1, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Succeeded);
    let session = launcher.session(0);
    let force_closed_at = (*session.force_closed_at.lock().unwrap()).expect("会话未被强制关闭");
    // 默认关闭超时 10 秒
    assert!(force_closed_at - started >= Duration::from_secs(10));
    assert!(force_closed_at - started < Duration::from_secs(11));
    assert_eq!(tasks.task(1).status, TaskStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_covers_hanging_launch() {
    let mut task = make_task(1, None, 0);
    task.timeout_minutes = Some(1);
    let tasks = MockTaskRepository::with_tasks(vec![task]);
    let ledger = MockQuotaLedger::new();
    let launcher = MockLauncher::scripted(vec![Behavior::LaunchHangs]);
    let sandbox = sandbox(&tasks, ledger.clone(), &launcher);

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(30 * 60),
        sandbox.run_task(1, CancellationToken::new()),
    )
    .await
    .expect("启动卡住时执行未在截止时间内结束")
    .unwrap();

    assert!(Instant::now() - started < Duration::from_secs(61));
    assert_eq!(
        outcome,
        TaskOutcome::RetryScheduled {
            retry_count: 1,
            max_retries: 3
        }
    );
    assert_eq!(launcher.launch_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(launcher.launches(), 0);
    let task = tasks.task(1);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(
        task.error_message.as_deref(),
        Some("执行超时，将自动重试 (1/3)")
    );
    assert_eq!(ledger.calls(), vec!["reserve", "release:r-1:TIMEOUT"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_hanging_launch() {
    let tasks = MockTaskRepository::with_tasks(vec![make_task(1, None, 0)]);
    let ledger = MockQuotaLedger::new();
    let launcher = MockLauncher::scripted(vec![Behavior::LaunchHangs]);
    let sandbox = Arc::new(sandbox(&tasks, ledger.clone(), &launcher));
    let cancel = CancellationToken::new();

    let running = {
        let sandbox = Arc::clone(&sandbox);
        let cancel = cancel.clone();
        tokio::spawn(async move { sandbox.run_task(1, cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();
    let outcome = running.await.unwrap().unwrap();

    assert_eq!(outcome, TaskOutcome::Cancelled);
    assert_eq!(tasks.task(1).status, TaskStatus::Cancelled);
    assert_eq!(tasks.task(1).retry_count, 0);
    assert_eq!(ledger.calls(), vec!["reserve", "release:r-1:CANCELLED"]);
}
