use std::sync::Arc;

use chrono::{Days, NaiveDate, NaiveTime, TimeZone, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use jobsched_domain::{
    DailyStatistics, Execution, ExecutionRepository, ExecutionStatus, StatisticsRecord,
    StatisticsRepository,
};
use jobsched_errors::{SchedulerError, SchedulerResult};
use jobsched_infrastructure::StructuredLogger;

/// 按 (任务, 日期) 聚合执行结果
///
/// 只统计 COMPLETED 与 FAILED；统计日期取结束时间的 UTC 日期。
/// 同一执行ID重复投递不会重复计数。
pub struct StatisticsAggregator {
    statistics: Arc<dyn StatisticsRepository>,
    executions: Arc<dyn ExecutionRepository>,
}

impl StatisticsAggregator {
    pub fn new(
        statistics: Arc<dyn StatisticsRepository>,
        executions: Arc<dyn ExecutionRepository>,
    ) -> Self {
        Self {
            statistics,
            executions,
        }
    }

    /// 累加一次执行，返回是否计入（重复投递返回 false）
    #[instrument(skip(self))]
    pub async fn record(
        &self,
        job_id: i64,
        date: NaiveDate,
        status: ExecutionStatus,
        duration_ms: Option<i64>,
        execution_id: Uuid,
    ) -> SchedulerResult<bool> {
        let successful = match status {
            ExecutionStatus::Completed => true,
            ExecutionStatus::Failed => false,
            other => {
                return Err(SchedulerError::validation_error(format!(
                    "只有 COMPLETED 或 FAILED 的执行计入统计，实际状态: {other}"
                )))
            }
        };

        let counted = self
            .statistics
            .record(&StatisticsRecord {
                job_id,
                stat_date: date,
                execution_id,
                successful,
                duration_ms,
            })
            .await?;
        StructuredLogger::log_statistics_recorded(job_id, execution_id, counted);
        Ok(counted)
    }

    pub async fn record_execution(&self, execution: &Execution) -> SchedulerResult<bool> {
        let ended_at = execution.ended_at.ok_or_else(|| {
            SchedulerError::validation_error(format!(
                "执行实例 {} 尚未结束，不能计入统计",
                execution.execution_id
            ))
        })?;
        self.record(
            execution.job_id,
            ended_at.date_naive(),
            execution.status,
            execution.duration_ms,
            execution.execution_id,
        )
        .await
    }

    pub async fn daily(
        &self,
        job_id: i64,
        date: NaiveDate,
    ) -> SchedulerResult<Option<DailyStatistics>> {
        self.statistics.get(job_id, date).await
    }

    /// 闭区间 [from, to] 内有数据的日期
    pub async fn range(
        &self,
        job_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SchedulerResult<Vec<DailyStatistics>> {
        if from > to {
            return Err(SchedulerError::validation_error(format!(
                "起始日期 {from} 晚于结束日期 {to}"
            )));
        }
        self.statistics.range(job_id, from, to).await
    }

    /// 区间内的总体成功率（百分比），无数据时为 0
    pub async fn success_rate(
        &self,
        job_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SchedulerResult<f64> {
        let (total, successful) = self
            .range(job_id, from, to)
            .await?
            .iter()
            .fold((0i64, 0i64), |(total, ok), day| {
                (total + day.total_executions, ok + day.successful_executions)
            });
        if total == 0 {
            return Ok(0.0);
        }
        Ok(successful as f64 / total as f64 * 100.0)
    }

    pub async fn failure_rate(
        &self,
        job_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SchedulerResult<f64> {
        let (total, failed) = self
            .range(job_id, from, to)
            .await?
            .iter()
            .fold((0i64, 0i64), |(total, failed), day| {
                (total + day.total_executions, failed + day.failed_executions)
            });
        if total == 0 {
            return Ok(0.0);
        }
        Ok(failed as f64 / total as f64 * 100.0)
    }

    /// 由执行历史重新计算某日统计并整体替换
    #[instrument(skip(self))]
    pub async fn backfill(&self, job_id: i64, date: NaiveDate) -> SchedulerResult<DailyStatistics> {
        let start = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
        let end = start + Days::new(1);

        let executions = self
            .executions
            .find_terminal_between(job_id, start, end)
            .await?;

        let mut stats = DailyStatistics::empty(job_id, date);
        let mut execution_ids = Vec::new();
        for execution in executions
            .iter()
            .filter(|e| matches!(e.status, ExecutionStatus::Completed | ExecutionStatus::Failed))
        {
            stats.apply(&StatisticsRecord {
                job_id,
                stat_date: date,
                execution_id: execution.execution_id,
                successful: execution.status == ExecutionStatus::Completed,
                duration_ms: execution.duration_ms,
            });
            execution_ids.push(execution.execution_id);
        }

        self.statistics.replace(&stats, &execution_ids).await?;
        info!(
            "任务 {} 在 {} 的统计已重算: 共 {} 次执行",
            job_id, date, stats.total_executions
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsched_infrastructure::InMemoryStore;
    use jobsched_testing_utils::ExecutionBuilder;

    fn aggregator() -> (StatisticsAggregator, jobsched_domain::Repositories) {
        let store = Arc::new(InMemoryStore::new());
        let repos = store.repositories();
        (
            StatisticsAggregator::new(repos.statistics.clone(), repos.executions.clone()),
            repos,
        )
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 20).unwrap()
    }

    #[tokio::test]
    async fn test_counts_and_idempotence() {
        let (aggregator, _) = aggregator();
        let mut ids = Vec::new();
        for duration in [100, 300] {
            let id = Uuid::new_v4();
            ids.push(id);
            assert!(aggregator
                .record(1, day(), ExecutionStatus::Completed, Some(duration), id)
                .await
                .unwrap());
        }
        let failed = Uuid::new_v4();
        aggregator
            .record(1, day(), ExecutionStatus::Failed, Some(50), failed)
            .await
            .unwrap();

        assert!(!aggregator
            .record(1, day(), ExecutionStatus::Completed, Some(100), ids[0])
            .await
            .unwrap());

        let stats = aggregator.daily(1, day()).await.unwrap().unwrap();
        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.successful_executions, 2);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.min_duration_ms, Some(50));
        assert_eq!(stats.max_duration_ms, Some(300));
        assert_eq!(stats.total_duration_ms, 450);
        assert_eq!(stats.avg_duration_ms(), Some(150.0));
    }

    #[tokio::test]
    async fn test_rejects_non_counted_status() {
        let (aggregator, _) = aggregator();
        let result = aggregator
            .record(1, day(), ExecutionStatus::Cancelled, None, Uuid::new_v4())
            .await;
        assert!(matches!(result, Err(SchedulerError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_rates_over_range() {
        let (aggregator, _) = aggregator();
        let next = day().succ_opt().unwrap();
        aggregator
            .record(1, day(), ExecutionStatus::Completed, Some(1), Uuid::new_v4())
            .await
            .unwrap();
        aggregator
            .record(1, next, ExecutionStatus::Failed, Some(1), Uuid::new_v4())
            .await
            .unwrap();
        aggregator
            .record(1, next, ExecutionStatus::Completed, Some(1), Uuid::new_v4())
            .await
            .unwrap();
        aggregator
            .record(1, next, ExecutionStatus::Completed, Some(1), Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(aggregator.range(1, day(), next).await.unwrap().len(), 2);
        assert!((aggregator.success_rate(1, day(), next).await.unwrap() - 75.0).abs() < 1e-9);
        assert!((aggregator.failure_rate(1, day(), next).await.unwrap() - 25.0).abs() < 1e-9);
        assert_eq!(aggregator.success_rate(2, day(), next).await.unwrap(), 0.0);
        assert!(aggregator.range(1, next, day()).await.is_err());
    }

    #[tokio::test]
    async fn test_backfill_rebuilds_from_history() {
        let (aggregator, repos) = aggregator();
        let base = Utc.from_utc_datetime(&day().and_hms_opt(8, 0, 0).unwrap());

        let completed = ExecutionBuilder::new(4)
            .running_since(base)
            .completed_at(base + chrono::Duration::milliseconds(200))
            .build();
        let failed = ExecutionBuilder::new(4)
            .running_since(base)
            .failed_at(base + chrono::Duration::milliseconds(400), "boom")
            .build();
        let cancelled = ExecutionBuilder::new(4)
            .finished(ExecutionStatus::Cancelled, base)
            .build();
        let other_day = ExecutionBuilder::new(4)
            .running_since(base + chrono::Duration::days(1))
            .completed_at(base + chrono::Duration::days(1))
            .build();
        for execution in [&completed, &failed, &cancelled, &other_day] {
            repos.executions.create(execution).await.unwrap();
        }

        // 只有一次成功被实时统计
        aggregator.record_execution(&completed).await.unwrap();

        let rebuilt = aggregator.backfill(4, day()).await.unwrap();
        assert_eq!(rebuilt.total_executions, 2);
        assert_eq!(rebuilt.successful_executions, 1);
        assert_eq!(rebuilt.failed_executions, 1);
        assert_eq!(rebuilt.max_duration_ms, Some(400));

        assert_eq!(aggregator.daily(4, day()).await.unwrap().unwrap(), rebuilt);
        assert!(!aggregator.record_execution(&failed).await.unwrap());
    }
}
