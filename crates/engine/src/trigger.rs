use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobsched_config::TriggerConfig;
use jobsched_domain::{Clock, ScheduleRepository};
use jobsched_errors::SchedulerResult;

use crate::cron_utils::CronScheduler;

/// 一次到期触发："运行任务 J"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSignal {
    pub job_id: i64,
    pub schedule_id: i64,
    pub fire_time: DateTime<Utc>,
}

/// 基于 CRON 的触发源
///
/// 周期性扫描激活的 (任务, 调度) 关联，计算到期触发点并记录为已触发。
pub struct CronTriggerSource {
    schedules: Arc<dyn ScheduleRepository>,
    clock: Arc<dyn Clock>,
    config: TriggerConfig,
}

impl CronTriggerSource {
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
        clock: Arc<dyn Clock>,
        config: TriggerConfig,
    ) -> Self {
        Self {
            schedules,
            clock,
            config,
        }
    }

    /// 扫描一次，返回本次到期的触发信号
    pub async fn poll(&self) -> SchedulerResult<Vec<TriggerSignal>> {
        let now = self.clock.now();
        let lookback = chrono::Duration::seconds(self.config.poll_interval_seconds as i64);
        let mut signals = Vec::new();

        for scheduled in self.schedules.active_scheduled_jobs().await? {
            let schedule = &scheduled.schedule;
            let link = &scheduled.link;

            let scheduler =
                match CronScheduler::new(&schedule.cron_expression, &schedule.timezone) {
                    Ok(scheduler) => scheduler,
                    Err(e) => {
                        warn!("调度 {} 的定义无效，跳过: {}", schedule.id, e);
                        continue;
                    }
                };

            if let Some(fire_time) = scheduler.due_fire_time(link.last_fired_at, now, lookback) {
                self.schedules
                    .mark_fired(link.job_id, link.schedule_id, fire_time)
                    .await?;
                debug!(
                    "任务 {} 到达调度时间: 调度={}, 触发点={}",
                    link.job_id,
                    link.schedule_id,
                    fire_time.format("%Y-%m-%d %H:%M:%S UTC")
                );
                signals.push(TriggerSignal {
                    job_id: link.job_id,
                    schedule_id: link.schedule_id,
                    fire_time,
                });
            }
        }

        Ok(signals)
    }

    /// 按轮询间隔持续扫描，直到收到关闭信号或接收端关闭
    pub async fn run(self, sender: mpsc::Sender<TriggerSignal>, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("CRON触发源未启用");
            return;
        }

        info!(
            "启动CRON触发源，轮询间隔 {} 秒",
            self.config.poll_interval_seconds
        );
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("CRON触发源收到关闭信号");
                    break;
                }
                _ = ticker.tick() => {
                    let signals = match self.poll().await {
                        Ok(signals) => signals,
                        Err(e) => {
                            error!("扫描调度失败: {}", e);
                            continue;
                        }
                    };
                    for signal in signals {
                        if sender.send(signal).await.is_err() {
                            warn!("触发信号接收端已关闭，停止CRON触发源");
                            return;
                        }
                    }
                }
            }
        }
    }
}
