//! 执行核心的指标采集
//!
//! 基于 `metrics` crate 注册计数器、直方图与仪表；是否导出由二进制程序安装的
//! recorder 决定，未安装时所有记录均为空操作。

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

pub struct MetricsCollector {
    executions_admitted_total: Counter,
    executions_rejected_total: Counter,
    executions_completed_total: Counter,
    executions_failed_total: Counter,
    executions_cancelled_total: Counter,
    lock_acquired_total: Counter,
    lock_contention_total: Counter,
    storage_failures_total: Counter,
    executions_recovered_total: Counter,
    execution_duration: Histogram,
    running_executions: Gauge,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            executions_admitted_total: counter!("jobsched_executions_admitted_total"),
            executions_rejected_total: counter!("jobsched_executions_rejected_total"),
            executions_completed_total: counter!("jobsched_executions_completed_total"),
            executions_failed_total: counter!("jobsched_executions_failed_total"),
            executions_cancelled_total: counter!("jobsched_executions_cancelled_total"),
            lock_acquired_total: counter!("jobsched_lock_acquired_total"),
            lock_contention_total: counter!("jobsched_lock_contention_total"),
            storage_failures_total: counter!("jobsched_storage_failures_total"),
            executions_recovered_total: counter!("jobsched_executions_recovered_total"),
            execution_duration: histogram!("jobsched_execution_duration_seconds"),
            running_executions: gauge!("jobsched_running_executions"),
        }
    }

    pub fn record_admitted(&self) {
        self.executions_admitted_total.increment(1);
    }

    /// 拒绝按原因代码分维度计数
    pub fn record_rejected(&self, reason_code: &'static str) {
        self.executions_rejected_total.increment(1);
        counter!("jobsched_executions_rejected_by_reason_total", "reason" => reason_code)
            .increment(1);
    }

    pub fn record_completed(&self, duration_ms: Option<i64>) {
        self.executions_completed_total.increment(1);
        self.record_duration(duration_ms);
    }

    pub fn record_failed(&self, duration_ms: Option<i64>) {
        self.executions_failed_total.increment(1);
        self.record_duration(duration_ms);
    }

    pub fn record_cancelled(&self) {
        self.executions_cancelled_total.increment(1);
    }

    pub fn record_lock_acquired(&self) {
        self.lock_acquired_total.increment(1);
    }

    pub fn record_lock_contention(&self) {
        self.lock_contention_total.increment(1);
    }

    pub fn record_storage_failure(&self) {
        self.storage_failures_total.increment(1);
    }

    pub fn record_recovered(&self) {
        self.executions_recovered_total.increment(1);
    }

    pub fn set_running_executions(&self, count: usize) {
        self.running_executions.set(count as f64);
    }

    fn record_duration(&self, duration_ms: Option<i64>) {
        if let Some(ms) = duration_ms {
            self.execution_duration.record(ms as f64 / 1000.0);
        }
    }
}
