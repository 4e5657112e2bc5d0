//! 进程内存储
//!
//! 与 SQLite 仓储实现相同的接口，供嵌入式模式和测试使用。锁表由单个互斥锁保护，
//! 获取操作的检查与写入在同一临界区内完成。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use jobsched_domain::{
    DailyStatistics, DependencyRepository, Execution, ExecutionLock, ExecutionRepository,
    ExecutionStatus, Job, JobDependency, JobExecutionSummary, JobRepository, JobSchedule,
    JobStatus, LockRepository, Repositories, Schedule, ScheduleRepository, ScheduledJob,
    StatisticsRecord, StatisticsRepository,
};
use jobsched_errors::{SchedulerError, SchedulerResult};

#[derive(Default)]
struct StatisticsState {
    buckets: HashMap<(i64, NaiveDate), DailyStatistics>,
    ledger: HashMap<Uuid, (i64, NaiveDate)>,
}

#[derive(Default)]
pub struct InMemoryStore {
    next_job_id: AtomicI64,
    next_schedule_id: AtomicI64,
    jobs: RwLock<HashMap<i64, Job>>,
    schedules: RwLock<HashMap<i64, Schedule>>,
    links: RwLock<HashMap<(i64, i64), JobSchedule>>,
    dependencies: RwLock<Vec<JobDependency>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
    locks: Mutex<HashMap<i64, ExecutionLock>>,
    statistics: Mutex<StatisticsState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以同一个存储实例提供全部仓储接口
    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            jobs: self.clone(),
            schedules: self.clone(),
            dependencies: self.clone(),
            executions: self.clone(),
            locks: self.clone(),
            statistics: self.clone(),
        }
    }

    async fn collect_executions<F>(&self, mut filter: F) -> Vec<Execution>
    where
        F: FnMut(&Execution) -> bool,
    {
        self.executions
            .read()
            .await
            .values()
            .filter(|e| filter(e))
            .cloned()
            .collect()
    }
}

fn newest_first(executions: &mut [Execution]) {
    executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[async_trait]
impl JobRepository for InMemoryStore {
    async fn create(&self, job: &Job) -> SchedulerResult<Job> {
        let mut created = job.clone();
        created.id = self.next_job_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.jobs.write().await.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_job(&self, id: i64) -> SchedulerResult<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_jobs(&self) -> SchedulerResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn set_status(&self, id: i64, status: JobStatus) -> SchedulerResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) => {
                job.status = status;
                job.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryStore {
    async fn create_schedule(&self, schedule: &Schedule) -> SchedulerResult<Schedule> {
        let mut created = schedule.clone();
        created.id = self.next_schedule_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.schedules
            .write()
            .await
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_schedule(&self, id: i64) -> SchedulerResult<Option<Schedule>> {
        Ok(self.schedules.read().await.get(&id).cloned())
    }

    async fn link(&self, job_id: i64, schedule_id: i64) -> SchedulerResult<JobSchedule> {
        let mut links = self.links.write().await;
        if links.contains_key(&(job_id, schedule_id)) {
            return Err(SchedulerError::DuplicateScheduleLink {
                job_id,
                schedule_id,
            });
        }
        let link = JobSchedule {
            job_id,
            schedule_id,
            is_active: true,
            last_fired_at: None,
            created_at: Utc::now(),
        };
        links.insert((job_id, schedule_id), link.clone());
        Ok(link)
    }

    async fn unlink(&self, job_id: i64, schedule_id: i64) -> SchedulerResult<bool> {
        Ok(self
            .links
            .write()
            .await
            .remove(&(job_id, schedule_id))
            .is_some())
    }

    async fn get_link(
        &self,
        job_id: i64,
        schedule_id: i64,
    ) -> SchedulerResult<Option<JobSchedule>> {
        Ok(self.links.read().await.get(&(job_id, schedule_id)).cloned())
    }

    async fn links_for_job(&self, job_id: i64) -> SchedulerResult<Vec<JobSchedule>> {
        let mut links: Vec<JobSchedule> = self
            .links
            .read()
            .await
            .values()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.schedule_id);
        Ok(links)
    }

    async fn set_links_active(&self, job_id: i64, active: bool) -> SchedulerResult<u64> {
        let mut links = self.links.write().await;
        let mut changed = 0;
        for link in links.values_mut().filter(|l| l.job_id == job_id) {
            link.is_active = active;
            changed += 1;
        }
        Ok(changed)
    }

    async fn active_scheduled_jobs(&self) -> SchedulerResult<Vec<ScheduledJob>> {
        let links = self.links.read().await;
        let schedules = self.schedules.read().await;
        let mut active: Vec<ScheduledJob> = links
            .values()
            .filter(|l| l.is_active)
            .filter_map(|l| {
                schedules
                    .get(&l.schedule_id)
                    .filter(|s| s.is_active)
                    .map(|s| ScheduledJob {
                        link: l.clone(),
                        schedule: s.clone(),
                    })
            })
            .collect();
        active.sort_by_key(|s| (s.link.job_id, s.link.schedule_id));
        Ok(active)
    }

    async fn mark_fired(
        &self,
        job_id: i64,
        schedule_id: i64,
        fired_at: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        if let Some(link) = self.links.write().await.get_mut(&(job_id, schedule_id)) {
            link.last_fired_at = Some(fired_at);
        }
        Ok(())
    }
}

#[async_trait]
impl DependencyRepository for InMemoryStore {
    async fn add(&self, dependency: &JobDependency) -> SchedulerResult<()> {
        let mut edges = self.dependencies.write().await;
        if edges.iter().any(|e| {
            e.dependent_job_id == dependency.dependent_job_id
                && e.prerequisite_job_id == dependency.prerequisite_job_id
        }) {
            return Err(SchedulerError::DuplicateDependency {
                dependent: dependency.dependent_job_id,
                prerequisite: dependency.prerequisite_job_id,
            });
        }
        edges.push(dependency.clone());
        Ok(())
    }

    async fn remove(
        &self,
        dependent_job_id: i64,
        prerequisite_job_id: i64,
    ) -> SchedulerResult<bool> {
        let mut edges = self.dependencies.write().await;
        let before = edges.len();
        edges.retain(|e| {
            !(e.dependent_job_id == dependent_job_id
                && e.prerequisite_job_id == prerequisite_job_id)
        });
        Ok(edges.len() != before)
    }

    async fn prerequisites_of(&self, job_id: i64) -> SchedulerResult<Vec<JobDependency>> {
        Ok(self
            .dependencies
            .read()
            .await
            .iter()
            .filter(|e| e.dependent_job_id == job_id)
            .cloned()
            .collect())
    }

    async fn dependents_of(&self, job_id: i64) -> SchedulerResult<Vec<JobDependency>> {
        Ok(self
            .dependencies
            .read()
            .await
            .iter()
            .filter(|e| e.prerequisite_job_id == job_id)
            .cloned()
            .collect())
    }

    async fn all(&self) -> SchedulerResult<Vec<JobDependency>> {
        Ok(self.dependencies.read().await.clone())
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryStore {
    async fn create(&self, execution: &Execution) -> SchedulerResult<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.execution_id) {
            return Err(SchedulerError::DatabaseOperation(format!(
                "执行记录已存在: {}",
                execution.execution_id
            )));
        }
        executions.insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> SchedulerResult<Option<Execution>> {
        Ok(self.executions.read().await.get(&execution_id).cloned())
    }

    async fn update_if_status(
        &self,
        execution: &Execution,
        expected: &[ExecutionStatus],
    ) -> SchedulerResult<bool> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution.execution_id) {
            Some(current) if expected.contains(&current.status) => {
                *current = execution.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn most_recent_terminal(
        &self,
        job_id: i64,
        since: DateTime<Utc>,
    ) -> SchedulerResult<Option<Execution>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.job_id == job_id && e.is_terminal())
            .filter(|e| e.ended_at.is_some_and(|ended| ended >= since))
            .max_by_key(|e| e.ended_at)
            .cloned())
    }

    async fn find_by_job(&self, job_id: i64, limit: i64) -> SchedulerResult<Vec<Execution>> {
        let mut found = self.collect_executions(|e| e.job_id == job_id).await;
        newest_first(&mut found);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn find_by_status(&self, status: ExecutionStatus) -> SchedulerResult<Vec<Execution>> {
        let mut found = self.collect_executions(|e| e.status == status).await;
        newest_first(&mut found);
        Ok(found)
    }

    async fn find_recent(&self, limit: i64) -> SchedulerResult<Vec<Execution>> {
        let mut found = self.collect_executions(|_| true).await;
        newest_first(&mut found);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn find_non_terminal(&self, job_id: i64) -> SchedulerResult<Vec<Execution>> {
        let mut found = self
            .collect_executions(|e| e.job_id == job_id && !e.is_terminal())
            .await;
        found.sort_by_key(|e| e.created_at);
        Ok(found)
    }

    async fn find_terminal_between(
        &self,
        job_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Execution>> {
        let mut found = self
            .collect_executions(|e| {
                e.job_id == job_id
                    && e.is_terminal()
                    && e.ended_at.is_some_and(|ended| ended >= from && ended < to)
            })
            .await;
        found.sort_by_key(|e| e.ended_at);
        Ok(found)
    }

    async fn summary(&self, job_id: i64) -> SchedulerResult<JobExecutionSummary> {
        let mut summary = JobExecutionSummary {
            job_id,
            ..Default::default()
        };
        for execution in self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.job_id == job_id)
        {
            summary.add(execution.status, 1);
        }
        Ok(summary)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, e| !(e.is_terminal() && e.ended_at.is_some_and(|t| t < cutoff)));
        Ok((before - executions.len()) as u64)
    }
}

#[async_trait]
impl LockRepository for InMemoryStore {
    async fn try_acquire(&self, lock: &ExecutionLock) -> SchedulerResult<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get(&lock.job_id) {
            Some(existing) if existing.is_live(lock.acquired_at) => Ok(false),
            _ => {
                locks.insert(lock.job_id, lock.clone());
                Ok(true)
            }
        }
    }

    async fn release(&self, job_id: i64, holder: &str) -> SchedulerResult<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get(&job_id) {
            Some(existing) if existing.lock_holder == holder => {
                locks.remove(&job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_id: i64) -> SchedulerResult<Option<ExecutionLock>> {
        Ok(self.locks.lock().await.get(&job_id).cloned())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| lock.is_live(now));
        Ok((before - locks.len()) as u64)
    }
}

#[async_trait]
impl StatisticsRepository for InMemoryStore {
    async fn record(&self, record: &StatisticsRecord) -> SchedulerResult<bool> {
        let mut state = self.statistics.lock().await;
        if state.ledger.contains_key(&record.execution_id) {
            return Ok(false);
        }
        state
            .ledger
            .insert(record.execution_id, (record.job_id, record.stat_date));
        state
            .buckets
            .entry((record.job_id, record.stat_date))
            .or_insert_with(|| DailyStatistics::empty(record.job_id, record.stat_date))
            .apply(record);
        Ok(true)
    }

    async fn get(&self, job_id: i64, date: NaiveDate) -> SchedulerResult<Option<DailyStatistics>> {
        Ok(self
            .statistics
            .lock()
            .await
            .buckets
            .get(&(job_id, date))
            .cloned())
    }

    async fn range(
        &self,
        job_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SchedulerResult<Vec<DailyStatistics>> {
        let state = self.statistics.lock().await;
        let mut found: Vec<DailyStatistics> = state
            .buckets
            .values()
            .filter(|s| s.job_id == job_id && s.stat_date >= from && s.stat_date <= to)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.stat_date);
        Ok(found)
    }

    async fn replace(
        &self,
        stats: &DailyStatistics,
        execution_ids: &[Uuid],
    ) -> SchedulerResult<()> {
        let mut state = self.statistics.lock().await;
        let key = (stats.job_id, stats.stat_date);
        state.ledger.retain(|_, bucket| *bucket != key);
        let ids: HashSet<&Uuid> = execution_ids.iter().collect();
        for id in ids {
            state.ledger.insert(*id, key);
        }
        state.buckets.insert(key, stats.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_acquire_is_exclusive_until_expiry() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(5);

        assert!(store
            .try_acquire(&ExecutionLock::new(1, "h1", now, ttl))
            .await
            .unwrap());
        assert!(!store
            .try_acquire(&ExecutionLock::new(1, "h2", now + chrono::Duration::seconds(4), ttl))
            .await
            .unwrap());
        assert!(store
            .try_acquire(&ExecutionLock::new(1, "h2", now + chrono::Duration::seconds(6), ttl))
            .await
            .unwrap());
        assert!(!store.release(1, "h1").await.unwrap());
        assert!(store.release(1, "h2").await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_update_applies_once() {
        let store = InMemoryStore::new();
        let mut execution = Execution::new(1, None, serde_json::json!({}), Utc::now());
        ExecutionRepository::create(&store, &execution).await.unwrap();

        execution.finish(ExecutionStatus::Cancelled, Utc::now());
        let sources = ExecutionStatus::Cancelled.allowed_sources();
        assert!(store.update_if_status(&execution, sources).await.unwrap());

        execution.status = ExecutionStatus::Failed;
        assert!(!store
            .update_if_status(&execution, ExecutionStatus::Failed.allowed_sources())
            .await
            .unwrap());

        let stored = ExecutionRepository::get(&store, execution.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }
}
