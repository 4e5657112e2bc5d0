//! 领域仓储抽象
//!
//! 执行核心只通过这些接口访问存储。同一组接口有内存和 SQLite 两种实现，
//! 锁获取与执行状态转换都要求在存储层以单次原子条件写完成。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::entities::{
    DailyStatistics, Execution, ExecutionLock, ExecutionStatus, Job, JobDependency,
    JobExecutionSummary, JobSchedule, JobStatus, Schedule, ScheduledJob, StatisticsRecord,
};
use jobsched_errors::SchedulerResult;

/// 任务目录
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: &Job) -> SchedulerResult<Job>;
    async fn get_job(&self, id: i64) -> SchedulerResult<Option<Job>>;
    async fn list_jobs(&self) -> SchedulerResult<Vec<Job>>;
    async fn set_status(&self, id: i64, status: JobStatus) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn create_schedule(&self, schedule: &Schedule) -> SchedulerResult<Schedule>;
    async fn get_schedule(&self, id: i64) -> SchedulerResult<Option<Schedule>>;
    /// 新建关联；关联已存在时返回 `DuplicateScheduleLink`
    async fn link(&self, job_id: i64, schedule_id: i64) -> SchedulerResult<JobSchedule>;
    async fn unlink(&self, job_id: i64, schedule_id: i64) -> SchedulerResult<bool>;
    async fn get_link(&self, job_id: i64, schedule_id: i64)
        -> SchedulerResult<Option<JobSchedule>>;
    async fn links_for_job(&self, job_id: i64) -> SchedulerResult<Vec<JobSchedule>>;
    /// 批量启用/停用任务的全部关联，返回受影响行数
    async fn set_links_active(&self, job_id: i64, active: bool) -> SchedulerResult<u64>;
    /// 关联与调度均为激活状态的条目
    async fn active_scheduled_jobs(&self) -> SchedulerResult<Vec<ScheduledJob>>;
    async fn mark_fired(
        &self,
        job_id: i64,
        schedule_id: i64,
        fired_at: DateTime<Utc>,
    ) -> SchedulerResult<()>;
}

#[async_trait]
pub trait DependencyRepository: Send + Sync {
    /// 新增依赖边；同一有序对已存在时返回 `DuplicateDependency`
    async fn add(&self, dependency: &JobDependency) -> SchedulerResult<()>;
    async fn remove(&self, dependent_job_id: i64, prerequisite_job_id: i64)
        -> SchedulerResult<bool>;
    async fn prerequisites_of(&self, job_id: i64) -> SchedulerResult<Vec<JobDependency>>;
    async fn dependents_of(&self, job_id: i64) -> SchedulerResult<Vec<JobDependency>>;
    async fn all(&self) -> SchedulerResult<Vec<JobDependency>>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn create(&self, execution: &Execution) -> SchedulerResult<()>;
    async fn get(&self, execution_id: Uuid) -> SchedulerResult<Option<Execution>>;
    /// 仅当当前状态属于 `expected` 时写入，返回是否写入成功
    async fn update_if_status(
        &self,
        execution: &Execution,
        expected: &[ExecutionStatus],
    ) -> SchedulerResult<bool>;
    /// `since` 之后结束的最近一次终态执行
    async fn most_recent_terminal(
        &self,
        job_id: i64,
        since: DateTime<Utc>,
    ) -> SchedulerResult<Option<Execution>>;
    async fn find_by_job(&self, job_id: i64, limit: i64) -> SchedulerResult<Vec<Execution>>;
    async fn find_by_status(&self, status: ExecutionStatus) -> SchedulerResult<Vec<Execution>>;
    async fn find_recent(&self, limit: i64) -> SchedulerResult<Vec<Execution>>;
    async fn find_non_terminal(&self, job_id: i64) -> SchedulerResult<Vec<Execution>>;
    /// 结束时间位于 [from, to) 的终态执行
    async fn find_terminal_between(
        &self,
        job_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Execution>>;
    async fn summary(&self, job_id: i64) -> SchedulerResult<JobExecutionSummary>;
    /// 删除 `cutoff` 之前结束的终态执行
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64>;
}

#[async_trait]
pub trait LockRepository: Send + Sync {
    /// 原子获取：不存在或已过期（`expires_at <= lock.acquired_at`）时写入
    async fn try_acquire(&self, lock: &ExecutionLock) -> SchedulerResult<bool>;
    /// 仅持有者匹配时删除
    async fn release(&self, job_id: i64, holder: &str) -> SchedulerResult<bool>;
    async fn get(&self, job_id: i64) -> SchedulerResult<Option<ExecutionLock>>;
    async fn delete_expired(&self, now: DateTime<Utc>) -> SchedulerResult<u64>;
}

#[async_trait]
pub trait StatisticsRepository: Send + Sync {
    /// 按执行ID去重累加；重复投递返回 false
    async fn record(&self, record: &StatisticsRecord) -> SchedulerResult<bool>;
    async fn get(&self, job_id: i64, date: NaiveDate) -> SchedulerResult<Option<DailyStatistics>>;
    async fn range(
        &self,
        job_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SchedulerResult<Vec<DailyStatistics>>;
    /// 用重新计算的结果整体替换某日统计及其去重记录
    async fn replace(
        &self,
        stats: &DailyStatistics,
        execution_ids: &[Uuid],
    ) -> SchedulerResult<()>;
}

/// 执行核心使用的全部仓储，由装配代码显式传入各组件
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub dependencies: Arc<dyn DependencyRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub locks: Arc<dyn LockRepository>,
    pub statistics: Arc<dyn StatisticsRepository>,
}
