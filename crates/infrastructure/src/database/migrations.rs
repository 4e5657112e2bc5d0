use sqlx::SqlitePool;
use tracing::{debug, info};

/// 建表语句。参与谓词比较的时间列统一存储为毫秒时间戳
const SCHEMA: &[(&str, &str)] = &[
    (
        "jobs",
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            job_type TEXT NOT NULL,
            default_parameters TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            timeout_seconds INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "schedules",
        r#"
        CREATE TABLE IF NOT EXISTS schedules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            cron_expression TEXT NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "job_schedules",
        r#"
        CREATE TABLE IF NOT EXISTS job_schedules (
            job_id INTEGER NOT NULL,
            schedule_id INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_fired_at INTEGER,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (job_id, schedule_id),
            FOREIGN KEY (job_id) REFERENCES jobs (id) ON DELETE CASCADE,
            FOREIGN KEY (schedule_id) REFERENCES schedules (id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "job_dependencies",
        r#"
        CREATE TABLE IF NOT EXISTS job_dependencies (
            dependent_job_id INTEGER NOT NULL,
            prerequisite_job_id INTEGER NOT NULL,
            dependency_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (dependent_job_id, prerequisite_job_id)
        )
        "#,
    ),
    (
        "job_executions",
        r#"
        CREATE TABLE IF NOT EXISTS job_executions (
            execution_id TEXT PRIMARY KEY,
            job_id INTEGER NOT NULL,
            schedule_id INTEGER,
            status TEXT NOT NULL,
            parameters TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            ended_at INTEGER,
            duration_ms INTEGER,
            result TEXT,
            error_message TEXT,
            error_detail TEXT
        )
        "#,
    ),
    (
        "execution_locks",
        r#"
        CREATE TABLE IF NOT EXISTS execution_locks (
            job_id INTEGER PRIMARY KEY,
            lock_holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "job_statistics",
        r#"
        CREATE TABLE IF NOT EXISTS job_statistics (
            job_id INTEGER NOT NULL,
            stat_date TEXT NOT NULL,
            total_executions INTEGER NOT NULL DEFAULT 0,
            successful_executions INTEGER NOT NULL DEFAULT 0,
            failed_executions INTEGER NOT NULL DEFAULT 0,
            timed_executions INTEGER NOT NULL DEFAULT 0,
            total_duration_ms INTEGER NOT NULL DEFAULT 0,
            min_duration_ms INTEGER,
            max_duration_ms INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (job_id, stat_date)
        )
        "#,
    ),
    (
        "statistics_ledger",
        r#"
        CREATE TABLE IF NOT EXISTS statistics_ledger (
            execution_id TEXT PRIMARY KEY,
            job_id INTEGER NOT NULL,
            stat_date TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        )
        "#,
    ),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_executions_job_status_ended ON job_executions(job_id, status, ended_at)",
    "CREATE INDEX IF NOT EXISTS idx_executions_status ON job_executions(status)",
    "CREATE INDEX IF NOT EXISTS idx_executions_created ON job_executions(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_dependencies_prerequisite ON job_dependencies(prerequisite_job_id)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_job_date ON statistics_ledger(job_id, stat_date)",
    "CREATE INDEX IF NOT EXISTS idx_locks_expires ON execution_locks(expires_at)",
];

/// 幂等的数据库迁移
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    info!("运行数据库迁移");

    for (table, ddl) in SCHEMA {
        debug!("创建表 {}", table);
        sqlx::query(ddl).execute(pool).await?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    info!("数据库迁移完成");
    Ok(())
}
