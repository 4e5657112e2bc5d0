use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    /// 执行器类型，由执行器注册表解析，如 "shell"、"http"
    pub job_type: String,
    pub default_parameters: serde_json::Value,
    pub status: JobStatus,
    pub timeout_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "INACTIVE")]
    Inactive,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "ACTIVE",
            JobStatus::Inactive => "INACTIVE",
        }
    }
}

impl Job {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 由存储层分配
            name: name.into(),
            job_type: job_type.into(),
            default_parameters: serde_json::json!({}),
            status: JobStatus::Active,
            timeout_seconds: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }

    /// 合并默认参数与触发参数，触发参数优先
    pub fn merge_parameters(&self, overrides: &serde_json::Value) -> serde_json::Value {
        match (&self.default_parameters, overrides) {
            (serde_json::Value::Object(base), serde_json::Value::Object(extra)) => {
                let mut merged = base.clone();
                for (key, value) in extra {
                    merged.insert(key.clone(), value.clone());
                }
                serde_json::Value::Object(merged)
            }
            (base, serde_json::Value::Null) => base.clone(),
            (_, other) => other.clone(),
        }
    }
}

/// 调度定义：CRON 表达式 + IANA 时区
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    pub cron_expression: String,
    pub timezone: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            cron_expression: cron_expression.into(),
            timezone: "UTC".to_string(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// 任务与调度的关联，(job_id, schedule_id) 唯一
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSchedule {
    pub job_id: i64,
    pub schedule_id: i64,
    pub is_active: bool,
    /// 最近一次触发对应的计划时间
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// 一个处于激活状态的关联及其调度定义
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub link: JobSchedule,
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DependencyType {
    #[serde(rename = "BLOCKING")]
    Blocking,
    #[serde(rename = "NON_BLOCKING")]
    NonBlocking,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Blocking => "BLOCKING",
            DependencyType::NonBlocking => "NON_BLOCKING",
        }
    }
}

/// 依赖边: dependent -> prerequisite
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDependency {
    pub dependent_job_id: i64,
    pub prerequisite_job_id: i64,
    pub dependency_type: DependencyType,
}

impl JobDependency {
    pub fn blocking(dependent_job_id: i64, prerequisite_job_id: i64) -> Self {
        Self {
            dependent_job_id,
            prerequisite_job_id,
            dependency_type: DependencyType::Blocking,
        }
    }

    pub fn non_blocking(dependent_job_id: i64, prerequisite_job_id: i64) -> Self {
        Self {
            dependent_job_id,
            prerequisite_job_id,
            dependency_type: DependencyType::NonBlocking,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl ExecutionStatus {
    pub const TERMINAL: [ExecutionStatus; 3] = [
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ExecutionStatus::Pending),
            "RUNNING" => Some(ExecutionStatus::Running),
            "COMPLETED" => Some(ExecutionStatus::Completed),
            "FAILED" => Some(ExecutionStatus::Failed),
            "CANCELLED" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// 允许进入该状态的前置状态
    pub fn allowed_sources(&self) -> &'static [ExecutionStatus] {
        match self {
            ExecutionStatus::Pending => &[],
            ExecutionStatus::Running => &[ExecutionStatus::Pending],
            ExecutionStatus::Completed => &[ExecutionStatus::Running],
            ExecutionStatus::Failed => &[ExecutionStatus::Pending, ExecutionStatus::Running],
            ExecutionStatus::Cancelled => &[ExecutionStatus::Pending, ExecutionStatus::Running],
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次任务执行的记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub job_id: i64,
    pub schedule_id: Option<i64>,
    pub status: ExecutionStatus,
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
}

impl Execution {
    pub fn new(
        job_id: i64,
        schedule_id: Option<i64>,
        parameters: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            job_id,
            schedule_id,
            status: ExecutionStatus::Pending,
            parameters,
            created_at,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            result: None,
            error_message: None,
            error_detail: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 标记结束，运行过的执行会计算耗时
    pub fn finish(&mut self, status: ExecutionStatus, ended_at: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(ended_at);
        self.duration_ms = self
            .started_at
            .map(|started| (ended_at - started).num_milliseconds().max(0));
    }
}

/// 任务的排他执行租约
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionLock {
    pub job_id: i64,
    pub lock_holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExecutionLock {
    pub fn new(
        job_id: i64,
        lock_holder: impl Into<String>,
        acquired_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            job_id,
            lock_holder: lock_holder.into(),
            acquired_at,
            expires_at: acquired_at + ttl,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// 统计一次终态执行的增量
#[derive(Debug, Clone)]
pub struct StatisticsRecord {
    pub job_id: i64,
    pub stat_date: NaiveDate,
    pub execution_id: Uuid,
    pub successful: bool,
    pub duration_ms: Option<i64>,
}

/// 任务按日统计
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyStatistics {
    pub job_id: i64,
    pub stat_date: NaiveDate,
    pub total_executions: i64,
    pub successful_executions: i64,
    pub failed_executions: i64,
    /// 带耗时的执行数，用于计算平均耗时
    pub timed_executions: i64,
    pub total_duration_ms: i64,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
}

impl DailyStatistics {
    pub fn empty(job_id: i64, stat_date: NaiveDate) -> Self {
        Self {
            job_id,
            stat_date,
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            timed_executions: 0,
            total_duration_ms: 0,
            min_duration_ms: None,
            max_duration_ms: None,
        }
    }

    /// 累加一次执行
    pub fn apply(&mut self, record: &StatisticsRecord) {
        self.total_executions += 1;
        if record.successful {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
        }
        if let Some(duration) = record.duration_ms {
            self.timed_executions += 1;
            self.total_duration_ms += duration;
            self.min_duration_ms = Some(self.min_duration_ms.map_or(duration, |m| m.min(duration)));
            self.max_duration_ms = Some(self.max_duration_ms.map_or(duration, |m| m.max(duration)));
        }
    }

    pub fn avg_duration_ms(&self) -> Option<f64> {
        if self.timed_executions == 0 {
            None
        } else {
            Some(self.total_duration_ms as f64 / self.timed_executions as f64)
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.successful_executions as f64 / self.total_executions as f64 * 100.0
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.failed_executions as f64 / self.total_executions as f64 * 100.0
        }
    }
}

/// 任务执行概况
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobExecutionSummary {
    pub job_id: i64,
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl JobExecutionSummary {
    pub fn add(&mut self, status: ExecutionStatus, count: i64) {
        self.total += count;
        match status {
            ExecutionStatus::Pending => self.pending += count,
            ExecutionStatus::Running => self.running += count,
            ExecutionStatus::Completed => self.completed += count,
            ExecutionStatus::Failed => self.failed += count,
            ExecutionStatus::Cancelled => self.cancelled += count,
        }
    }

    /// 成功率(%)，分母为已完成与失败之和
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64 * 100.0
        }
    }
}
