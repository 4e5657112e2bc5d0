use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use jobsched_domain::{
    Clock, DependencyRepository, DependencyType, ExecutionRepository, ExecutionStatus,
    JobDependency, JobRepository, RejectReason,
};
use jobsched_errors::{SchedulerError, SchedulerResult};
use jobsched_infrastructure::StructuredLogger;

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyCheckResult {
    pub allowed: bool,
    pub blocking_reason: Option<String>,
    pub blocking_prerequisites: Vec<i64>,
    /// 检查本身失败（存储不可用等），此时按失败关闭处理
    pub check_failed: bool,
}

impl DependencyCheckResult {
    fn allowed() -> Self {
        Self {
            allowed: true,
            blocking_reason: None,
            blocking_prerequisites: Vec::new(),
            check_failed: false,
        }
    }

    fn blocked(blocking_prerequisites: Vec<i64>, reason: String) -> Self {
        Self {
            allowed: false,
            blocking_reason: Some(reason),
            blocking_prerequisites,
            check_failed: false,
        }
    }

    fn unavailable(cause: String) -> Self {
        Self {
            allowed: false,
            blocking_reason: Some(cause),
            blocking_prerequisites: Vec::new(),
            check_failed: true,
        }
    }

    /// 未通过检查时对应的拒绝原因
    pub fn reject_reason(&self) -> Option<RejectReason> {
        if self.allowed {
            return None;
        }
        let detail = self.blocking_reason.clone().unwrap_or_default();
        if self.check_failed {
            Some(RejectReason::DependencyCheckUnavailable { cause: detail })
        } else {
            Some(RejectReason::DependencyUnsatisfied {
                blocking: self.blocking_prerequisites.clone(),
                detail,
            })
        }
    }
}

/// 依赖解析器
///
/// 阻塞型前置任务在新鲜度窗口内最近一次终态执行为 COMPLETED 时才视为满足。
/// 依赖图（包含所有边类型）始终保持无环，环在加边时被拒绝。
pub struct DependencyResolver {
    jobs: Arc<dyn JobRepository>,
    dependencies: Arc<dyn DependencyRepository>,
    executions: Arc<dyn ExecutionRepository>,
    clock: Arc<dyn Clock>,
    freshness_window: chrono::Duration,
    // 串行化加边，保证环检测与写入之间图不变
    graph_guard: Mutex<()>,
}

impl DependencyResolver {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        dependencies: Arc<dyn DependencyRepository>,
        executions: Arc<dyn ExecutionRepository>,
        clock: Arc<dyn Clock>,
        freshness_window: chrono::Duration,
    ) -> Self {
        Self {
            jobs,
            dependencies,
            executions,
            clock,
            freshness_window,
            graph_guard: Mutex::new(()),
        }
    }

    pub fn freshness_window(&self) -> chrono::Duration {
        self.freshness_window
    }

    /// 判断任务当前能否运行，任何查询失败都返回不允许
    #[instrument(skip(self))]
    pub async fn can_run(&self, job_id: i64) -> DependencyCheckResult {
        let result = match self.evaluate(job_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!("任务 {} 的依赖检查失败，按不满足处理: {}", job_id, e);
                DependencyCheckResult::unavailable(e.to_string())
            }
        };
        StructuredLogger::log_dependency_check(
            job_id,
            result.allowed,
            &result.blocking_prerequisites,
            result.blocking_reason.as_deref(),
        );
        result
    }

    async fn evaluate(&self, job_id: i64) -> SchedulerResult<DependencyCheckResult> {
        let blocking: Vec<JobDependency> = self
            .dependencies
            .prerequisites_of(job_id)
            .await?
            .into_iter()
            .filter(|d| d.dependency_type == DependencyType::Blocking)
            .collect();

        if blocking.is_empty() {
            return Ok(DependencyCheckResult::allowed());
        }

        let since = self.clock.now() - self.freshness_window;
        let mut unsatisfied = Vec::new();
        let mut details = Vec::new();

        for dependency in &blocking {
            let prerequisite = dependency.prerequisite_job_id;
            match self
                .executions
                .most_recent_terminal(prerequisite, since)
                .await?
            {
                Some(execution) if execution.status == ExecutionStatus::Completed => {
                    debug!("前置任务 {} 在窗口内执行成功", prerequisite);
                }
                Some(execution) => {
                    details.push(format!(
                        "任务 {} 最近一次执行状态为 {}",
                        prerequisite, execution.status
                    ));
                    unsatisfied.push(prerequisite);
                }
                None => {
                    details.push(format!("任务 {} 在新鲜度窗口内没有执行记录", prerequisite));
                    unsatisfied.push(prerequisite);
                }
            }
        }

        if unsatisfied.is_empty() {
            Ok(DependencyCheckResult::allowed())
        } else {
            Ok(DependencyCheckResult::blocked(unsatisfied, details.join("; ")))
        }
    }

    /// 新增依赖边，拒绝自依赖、重复边以及会形成环的边
    #[instrument(skip(self))]
    pub async fn add_dependency(
        &self,
        dependent_job_id: i64,
        prerequisite_job_id: i64,
        dependency_type: DependencyType,
    ) -> SchedulerResult<JobDependency> {
        if dependent_job_id == prerequisite_job_id {
            return Err(SchedulerError::InvalidDependency {
                dependent: dependent_job_id,
                prerequisite: prerequisite_job_id,
                reason: "任务不能依赖自身".to_string(),
            });
        }

        for id in [dependent_job_id, prerequisite_job_id] {
            if self.jobs.get_job(id).await?.is_none() {
                return Err(SchedulerError::job_not_found(id));
            }
        }

        let _guard = self.graph_guard.lock().await;

        // 新边 dependent -> prerequisite 成环，当且仅当 prerequisite 已经（传递地）依赖 dependent
        if self
            .reaches(prerequisite_job_id, dependent_job_id)
            .await?
        {
            warn!(
                "检测到循环依赖，任务ID: {}, 新依赖: {}",
                dependent_job_id, prerequisite_job_id
            );
            return Err(SchedulerError::CircularDependency {
                dependent: dependent_job_id,
                prerequisite: prerequisite_job_id,
            });
        }

        let dependency = JobDependency {
            dependent_job_id,
            prerequisite_job_id,
            dependency_type,
        };
        self.dependencies.add(&dependency).await?;
        debug!(
            "新增依赖: {} -> {} ({})",
            dependent_job_id,
            prerequisite_job_id,
            dependency_type.as_str()
        );
        Ok(dependency)
    }

    pub async fn remove_dependency(
        &self,
        dependent_job_id: i64,
        prerequisite_job_id: i64,
    ) -> SchedulerResult<bool> {
        let _guard = self.graph_guard.lock().await;
        self.dependencies
            .remove(dependent_job_id, prerequisite_job_id)
            .await
    }

    pub async fn prerequisites(&self, job_id: i64) -> SchedulerResult<Vec<JobDependency>> {
        self.dependencies.prerequisites_of(job_id).await
    }

    pub async fn dependents(&self, job_id: i64) -> SchedulerResult<Vec<JobDependency>> {
        self.dependencies.dependents_of(job_id).await
    }

    /// 沿依赖边 BFS 得到的全部（直接与间接）前置任务
    pub async fn transitive_prerequisites(&self, job_id: i64) -> SchedulerResult<Vec<i64>> {
        let graph = self.build_graph().await?;
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut result = Vec::new();

        if let Some(direct) = graph.get(&job_id) {
            for &id in direct {
                if visited.insert(id) {
                    queue.push_back(id);
                }
            }
        }
        while let Some(current) = queue.pop_front() {
            result.push(current);
            if let Some(next) = graph.get(&current) {
                for &id in next {
                    if visited.insert(id) {
                        queue.push_back(id);
                    }
                }
            }
        }

        Ok(result)
    }

    /// 拓扑序：前置任务排在依赖它的任务之前
    pub async fn topological_order(&self) -> SchedulerResult<Vec<i64>> {
        let edges = self.dependencies.all().await?;
        let mut in_degree: BTreeMap<i64, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<i64, Vec<i64>> = BTreeMap::new();

        for edge in &edges {
            in_degree.entry(edge.prerequisite_job_id).or_insert(0);
            *in_degree.entry(edge.dependent_job_id).or_insert(0) += 1;
            dependents
                .entry(edge.prerequisite_job_id)
                .or_default()
                .push(edge.dependent_job_id);
        }

        let mut queue: VecDeque<i64> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&node, _)| node)
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            if let Some(next) = dependents.get(&node) {
                for &dependent in next {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if order.len() < in_degree.len() {
            return Err(SchedulerError::Internal(
                "依赖图中存在环，无法排序".to_string(),
            ));
        }
        Ok(order)
    }

    /// dependent -> 前置任务列表
    async fn build_graph(&self) -> SchedulerResult<BTreeMap<i64, Vec<i64>>> {
        let mut graph: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for edge in self.dependencies.all().await? {
            graph
                .entry(edge.dependent_job_id)
                .or_default()
                .push(edge.prerequisite_job_id);
        }
        Ok(graph)
    }

    async fn reaches(&self, from: i64, target: i64) -> SchedulerResult<bool> {
        let graph = self.build_graph().await?;
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == target {
                return Ok(true);
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = graph.get(&current) {
                queue.extend(next.iter().copied());
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobsched_domain::{ExecutionStatus, Job, Repositories};
    use jobsched_infrastructure::InMemoryStore;
    use jobsched_testing_utils::{ExecutionBuilder, FailingExecutionRepository, ManualClock};

    struct Fixture {
        repos: Repositories,
        clock: Arc<ManualClock>,
        resolver: DependencyResolver,
    }

    async fn fixture(job_count: usize) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let repos = store.repositories();
        for i in 0..job_count {
            repos
                .jobs
                .create(&Job::new(format!("job-{i}"), "mock"))
                .await
                .unwrap();
        }
        let clock = Arc::new(ManualClock::starting_now());
        let resolver = DependencyResolver::new(
            repos.jobs.clone(),
            repos.dependencies.clone(),
            repos.executions.clone(),
            clock.clone(),
            Duration::hours(1),
        );
        Fixture {
            repos,
            clock,
            resolver,
        }
    }

    #[tokio::test]
    async fn test_no_dependencies_allowed() {
        let f = fixture(1).await;
        let result = f.resolver.can_run(1).await;
        assert!(result.allowed);
        assert!(result.reject_reason().is_none());
    }

    #[tokio::test]
    async fn test_non_blocking_never_gates() {
        let f = fixture(2).await;
        f.resolver
            .add_dependency(1, 2, DependencyType::NonBlocking)
            .await
            .unwrap();
        assert!(f.resolver.can_run(1).await.allowed);
    }

    #[tokio::test]
    async fn test_blocking_requires_recent_completion() {
        let f = fixture(2).await;
        f.resolver
            .add_dependency(1, 2, DependencyType::Blocking)
            .await
            .unwrap();

        let result = f.resolver.can_run(1).await;
        assert!(!result.allowed);
        assert_eq!(result.blocking_prerequisites, vec![2]);
        assert_eq!(
            result.reject_reason().unwrap().code(),
            "dependency unsatisfied"
        );

        let now = f.clock.now();
        let failed = ExecutionBuilder::new(2)
            .running_since(now - Duration::minutes(2))
            .failed_at(now - Duration::minutes(1), "boom")
            .build();
        f.repos.executions.create(&failed).await.unwrap();
        assert!(!f.resolver.can_run(1).await.allowed);

        let completed = ExecutionBuilder::new(2)
            .running_since(now - Duration::seconds(30))
            .completed_at(now)
            .build();
        f.repos.executions.create(&completed).await.unwrap();
        assert!(f.resolver.can_run(1).await.allowed);

        // 成功记录滑出窗口
        f.clock.advance(Duration::hours(2));
        assert!(!f.resolver.can_run(1).await.allowed);
    }

    #[tokio::test]
    async fn test_latest_terminal_wins() {
        let f = fixture(2).await;
        f.resolver
            .add_dependency(1, 2, DependencyType::Blocking)
            .await
            .unwrap();
        let now = f.clock.now();
        let ok = ExecutionBuilder::new(2)
            .finished(ExecutionStatus::Completed, now - Duration::minutes(10))
            .build();
        let cancelled = ExecutionBuilder::new(2)
            .finished(ExecutionStatus::Cancelled, now - Duration::minutes(5))
            .build();
        f.repos.executions.create(&ok).await.unwrap();
        f.repos.executions.create(&cancelled).await.unwrap();

        assert!(!f.resolver.can_run(1).await.allowed);
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_closed() {
        let store = Arc::new(InMemoryStore::new());
        let repos = store.repositories();
        repos.jobs.create(&Job::new("a", "mock")).await.unwrap();
        repos.jobs.create(&Job::new("b", "mock")).await.unwrap();
        let failing = Arc::new(FailingExecutionRepository::new(repos.executions.clone()));
        let resolver = DependencyResolver::new(
            repos.jobs.clone(),
            repos.dependencies.clone(),
            failing.clone(),
            Arc::new(ManualClock::starting_now()),
            Duration::hours(1),
        );
        resolver
            .add_dependency(1, 2, DependencyType::Blocking)
            .await
            .unwrap();

        failing.fail_reads(true);
        let result = resolver.can_run(1).await;
        assert!(!result.allowed);
        assert!(result.check_failed);
        assert_eq!(
            result.reject_reason().unwrap().code(),
            "dependency check unavailable"
        );
    }

    #[tokio::test]
    async fn test_rejects_self_duplicate_and_cycles() {
        let f = fixture(3).await;
        assert!(matches!(
            f.resolver
                .add_dependency(1, 1, DependencyType::Blocking)
                .await,
            Err(SchedulerError::InvalidDependency { .. })
        ));

        f.resolver
            .add_dependency(1, 2, DependencyType::Blocking)
            .await
            .unwrap();
        f.resolver
            .add_dependency(2, 3, DependencyType::NonBlocking)
            .await
            .unwrap();

        assert!(matches!(
            f.resolver
                .add_dependency(1, 2, DependencyType::NonBlocking)
                .await,
            Err(SchedulerError::DuplicateDependency { .. })
        ));
        assert!(matches!(
            f.resolver
                .add_dependency(3, 1, DependencyType::Blocking)
                .await,
            Err(SchedulerError::CircularDependency {
                dependent: 3,
                prerequisite: 1
            })
        ));
        assert!(matches!(
            f.resolver
                .add_dependency(1, 99, DependencyType::Blocking)
                .await,
            Err(SchedulerError::JobNotFound { id: 99 })
        ));
    }

    #[tokio::test]
    async fn test_graph_queries() {
        let f = fixture(4).await;
        f.resolver
            .add_dependency(1, 2, DependencyType::Blocking)
            .await
            .unwrap();
        f.resolver
            .add_dependency(2, 3, DependencyType::Blocking)
            .await
            .unwrap();
        f.resolver
            .add_dependency(1, 4, DependencyType::NonBlocking)
            .await
            .unwrap();

        let mut transitive = f.resolver.transitive_prerequisites(1).await.unwrap();
        transitive.sort();
        assert_eq!(transitive, vec![2, 3, 4]);

        let order = f.resolver.topological_order().await.unwrap();
        let position = |id: i64| order.iter().position(|&x| x == id).unwrap();
        assert!(position(3) < position(2));
        assert!(position(2) < position(1));
        assert!(position(4) < position(1));

        assert!(f.resolver.remove_dependency(2, 3).await.unwrap());
        assert_eq!(f.resolver.transitive_prerequisites(2).await.unwrap(), Vec::<i64>::new());
        assert_eq!(f.resolver.dependents(4).await.unwrap().len(), 1);
    }
}
