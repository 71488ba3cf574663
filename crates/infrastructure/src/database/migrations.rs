//! 内置表结构，连接池创建后执行

/// 时间列统一存储为定宽 RFC3339 文本，便于直接比较
pub const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS user_quotas (
        user_id INTEGER NOT NULL,
        quota_type TEXT NOT NULL,
        quota_limit INTEGER NOT NULL DEFAULT 0,
        used INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, quota_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS quota_reservations (
        id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        quota_type TEXT NOT NULL,
        amount INTEGER NOT NULL,
        status TEXT NOT NULL,
        client_id TEXT,
        task_info TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        confirmed_at TEXT,
        released_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_reservations_user_type_status ON quota_reservations(user_id, quota_type, status)",
    "CREATE INDEX IF NOT EXISTS idx_reservations_status_expires ON quota_reservations(status, expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS articles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        keyword TEXT,
        publishing_status TEXT,
        is_published INTEGER NOT NULL DEFAULT 0,
        published_at TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS publishing_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        article_id INTEGER REFERENCES articles(id) ON DELETE SET NULL,
        batch_id TEXT,
        batch_order INTEGER NOT NULL DEFAULT 0,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        keyword TEXT,
        account_id INTEGER NOT NULL,
        platform_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        scheduled_at TEXT,
        interval_minutes INTEGER NOT NULL DEFAULT 0,
        timeout_minutes INTEGER,
        started_at TEXT,
        completed_at TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_publishing_tasks_batch ON publishing_tasks(batch_id, batch_order)",
    "CREATE INDEX IF NOT EXISTS idx_publishing_tasks_status ON publishing_tasks(status, completed_at)",
    r#"
    CREATE TABLE IF NOT EXISTS publishing_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL REFERENCES publishing_tasks(id) ON DELETE CASCADE,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        details TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS publishing_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL UNIQUE,
        user_id INTEGER NOT NULL,
        article_id INTEGER,
        account_id INTEGER NOT NULL,
        platform_id TEXT NOT NULL,
        published_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS usage_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        feature_code TEXT NOT NULL,
        amount INTEGER NOT NULL DEFAULT 1,
        resource_type TEXT NOT NULL,
        resource_id INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (feature_code, resource_type, resource_id)
    )
    "#,
];
