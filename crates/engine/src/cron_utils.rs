use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use tracing::debug;

use jobsched_errors::{SchedulerError, SchedulerResult};

/// 带时区的CRON表达式解析和调度工具
///
/// 触发时间在调度所在时区内计算，对外统一返回 UTC。
pub struct CronScheduler {
    schedule: Schedule,
    timezone: Tz,
}

impl CronScheduler {
    pub fn new(cron_expr: &str, timezone: &str) -> SchedulerResult<Self> {
        let schedule = Self::parse(cron_expr)?;
        let timezone = Self::parse_timezone(timezone)?;
        Ok(Self { schedule, timezone })
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        Self::parse(cron_expr).map(|_| ())
    }

    pub fn parse_timezone(timezone: &str) -> SchedulerResult<Tz> {
        Tz::from_str(timezone).map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))
    }

    fn parse(cron_expr: &str) -> SchedulerResult<Schedule> {
        Schedule::from_str(cron_expr).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })
    }

    /// `from` 之后（不含）的下一次触发时间
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// `from` 之前（不含）的最近一次触发时间
    pub fn previous_before(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&self.timezone))
            .next_back()
            .map(|t| t.with_timezone(&Utc))
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&self.timezone))
            .take(count)
            .map(|t| t.with_timezone(&Utc))
            .collect()
    }

    /// 计算 (last, now] 区间内应当触发的时间点
    ///
    /// 错过的多个触发点合并为一次，返回其中最晚的一个。
    /// 从未触发过的关联只考虑 `now - lookback` 之后的触发点。
    pub fn due_fire_time(
        &self,
        last_fired: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        lookback: chrono::Duration,
    ) -> Option<DateTime<Utc>> {
        let check_from = last_fired.unwrap_or(now - lookback);
        let first = self.next_after(check_from)?;
        if first > now {
            return None;
        }

        let latest = self.previous_before(now + chrono::Duration::milliseconds(1))?;
        if latest != first {
            debug!(
                "合并错过的触发点: 首个={}, 最晚={}",
                first.format("%Y-%m-%d %H:%M:%S UTC"),
                latest.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        Some(latest)
    }

    /// 计算下次执行时间距离现在的时长
    pub fn time_until_next_execution(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.next_after(now).map(|next| next - now)
    }
}
