use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobsched_config::{AppConfig, ObservabilityConfig};
use jobsched_domain::{Clock, Repositories, SystemClock};
use jobsched_engine::{
    CronTriggerSource, JobEngine, LoggingNotificationDispatcher, RunnerRegistry,
};
use jobsched_infrastructure::{CleanupService, DatabaseManager, InMemoryStore, MetricsCollector};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 关闭时等待进行中执行退出的时长
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// 触发信号通道容量
const TRIGGER_CHANNEL_CAPACITY: usize = 256;

/// 主应用程序：数据库 + 执行核心 + 触发源 + 数据保留清理
pub struct Application {
    config: AppConfig,
    /// `database.url = "memory"` 时为空
    database: Option<DatabaseManager>,
    engine: Arc<JobEngine>,
    clock: Arc<dyn Clock>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序，实例: {}", config.engine.instance_id);

        // 指标句柄在创建时绑定 recorder，导出器必须先安装
        install_metrics_exporter(&config.observability)?;
        let metrics = Arc::new(MetricsCollector::new());

        let (database, repositories) = open_storage(&config).await?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let runners = RunnerRegistry::with_builtin();
        info!("已注册执行器类型: {:?}", runners.job_types());

        let engine = JobEngine::builder(repositories, config.engine.clone())
            .with_runners(runners)
            .with_clock(clock.clone())
            .with_metrics(metrics)
            .with_notifier(Arc::new(LoggingNotificationDispatcher))
            .build();

        Ok(Self {
            config,
            database,
            engine,
            clock,
        })
    }

    pub fn engine(&self) -> &Arc<JobEngine> {
        &self.engine
    }

    /// 运行至收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let repositories = self.engine.repositories().clone();
        let token = CancellationToken::new();

        // 上次进程遗留的未结束执行先于新触发处理
        match self.engine.recover_orphaned_executions().await {
            Ok(report) => info!(
                "启动恢复检查完成: 检查 {} 个，恢复 {} 个，耗时 {}ms",
                report.inspected,
                report.recovered.len(),
                report.recovery_duration_ms
            ),
            Err(e) => error!("启动恢复检查失败: {}", e),
        }
        let recovery_handle = tokio::spawn(self.engine.recovery().clone().run(
            Duration::from_secs(self.config.retention.sweep_interval_seconds),
            token.clone(),
        ));

        let (sender, receiver) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let trigger = CronTriggerSource::new(
            repositories.schedules.clone(),
            self.clock.clone(),
            self.config.trigger.clone(),
        );
        let trigger_handle = tokio::spawn(trigger.run(sender, token.clone()));
        let dispatch_handle = tokio::spawn(
            self.engine
                .clone()
                .run_dispatch_loop(receiver, token.clone()),
        );

        let mut cleanup = CleanupService::new(
            repositories.executions.clone(),
            repositories.locks.clone(),
            self.clock.clone(),
            self.config.retention.clone(),
        );
        cleanup.start().await.context("启动数据保留清理失败")?;

        info!("应用程序已启动");
        let _ = shutdown_rx.recv().await;
        info!("应用程序收到关闭信号");

        token.cancel();
        let (trigger_result, dispatch_result, recovery_result) =
            tokio::join!(trigger_handle, dispatch_handle, recovery_handle);
        if let Err(e) = trigger_result {
            error!("CRON触发源异常退出: {}", e);
        }
        if let Err(e) = dispatch_result {
            error!("触发分发循环异常退出: {}", e);
        }
        if let Err(e) = recovery_result {
            error!("孤儿执行恢复循环异常退出: {}", e);
        }

        if let Err(e) = cleanup.stop().await {
            error!("停止数据保留清理失败: {}", e);
        }
        self.engine.shutdown(SHUTDOWN_GRACE).await;
        if let Some(database) = &self.database {
            database.close().await;
        }

        info!("应用程序已停止");
        Ok(())
    }
}

async fn open_storage(config: &AppConfig) -> Result<(Option<DatabaseManager>, Repositories)> {
    if config.database.is_memory() {
        warn!("使用内存存储，进程退出后数据不会保留");
        let store = Arc::new(InMemoryStore::new());
        return Ok((None, store.repositories()));
    }

    let database = DatabaseManager::new(&config.database)
        .await
        .context("初始化数据库失败")?;
    let repositories = database.repositories();
    Ok((Some(database), repositories))
}

/// 按配置安装 Prometheus 导出器
pub fn install_metrics_exporter(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus指标导出器失败")?;

    info!("Prometheus指标导出器监听于 {}", addr);
    Ok(())
}
