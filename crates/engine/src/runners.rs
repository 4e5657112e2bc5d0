//! 执行器注册表与内置执行器
//!
//! 注册表在启动时按任务类型构建，之后只读。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

use jobsched_domain::{JobRunner, RunContext};
use jobsched_errors::{SchedulerError, SchedulerResult};

#[derive(Default, Clone)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn JobRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 `shell` 与 `http` 两个内置执行器
    pub fn with_builtin() -> Self {
        Self::new()
            .with_runner("shell", Arc::new(ShellRunner::new()))
            .with_runner("http", Arc::new(HttpRunner::new()))
    }

    pub fn with_runner(mut self, job_type: &str, runner: Arc<dyn JobRunner>) -> Self {
        self.register(job_type, runner);
        self
    }

    pub fn register(&mut self, job_type: &str, runner: Arc<dyn JobRunner>) {
        if self.runners.insert(job_type.to_string(), runner).is_some() {
            warn!("任务类型 {} 的执行器被覆盖", job_type);
        }
    }

    pub fn get(&self, job_type: &str) -> SchedulerResult<Arc<dyn JobRunner>> {
        self.runners
            .get(job_type)
            .cloned()
            .ok_or_else(|| SchedulerError::RunnerNotFound(job_type.to_string()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.runners.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.runners.keys().cloned().collect();
        types.sort();
        types
    }
}

#[derive(Debug, Deserialize)]
struct ShellParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Shell任务执行器
///
/// 取消时子进程被终止。
#[derive(Debug, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobRunner for ShellRunner {
    async fn run(&self, ctx: RunContext) -> SchedulerResult<serde_json::Value> {
        let params: ShellParams = serde_json::from_value(ctx.parameters.clone()).map_err(|e| {
            SchedulerError::validation_error(format!("解析Shell任务参数失败: {e}"))
        })?;

        info!(
            "执行Shell任务: execution_id={}, command={}, args={:?}",
            ctx.execution_id, params.command, params.args
        );

        let start_time = Instant::now();
        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .envs(&params.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| SchedulerError::RunnerFailure(format!("启动Shell命令失败: {e}")))?;

        // 取消时丢弃等待中的 future，kill_on_drop 负责终止子进程
        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| SchedulerError::RunnerFailure(format!("等待进程结束失败: {e}")))?,
            _ = ctx.cancellation.cancelled() => {
                warn!("Shell任务被取消，终止子进程: execution_id={}", ctx.execution_id);
                return Err(SchedulerError::RunnerFailure("Shell任务已取消".to_string()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let exit_code = output.status.code();

        info!(
            "Shell任务执行完成: execution_id={}, success={}, exit_code={:?}, duration={}ms",
            ctx.execution_id,
            output.status.success(),
            exit_code,
            start_time.elapsed().as_millis()
        );

        if !output.status.success() {
            let message = if stderr.is_empty() {
                format!("命令执行失败，退出码: {exit_code:?}")
            } else {
                format!("命令执行失败，退出码: {exit_code:?}: {stderr}")
            };
            return Err(SchedulerError::RunnerFailure(message));
        }

        Ok(serde_json::json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }

    fn name(&self) -> &str {
        "shell"
    }
}

#[derive(Debug, Deserialize)]
struct HttpParams {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

/// HTTP任务执行器
pub struct HttpRunner {
    client: reqwest::Client,
}

impl HttpRunner {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRunner for HttpRunner {
    async fn run(&self, ctx: RunContext) -> SchedulerResult<serde_json::Value> {
        let params: HttpParams = serde_json::from_value(ctx.parameters.clone()).map_err(|e| {
            SchedulerError::validation_error(format!("解析HTTP任务参数失败: {e}"))
        })?;
        let method = params.method.unwrap_or_else(|| "GET".to_string());

        info!(
            "执行HTTP任务: execution_id={}, method={}, url={}",
            ctx.execution_id, method, params.url
        );

        let mut request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(&params.url),
            "POST" => self.client.post(&params.url),
            "PUT" => self.client.put(&params.url),
            "DELETE" => self.client.delete(&params.url),
            "PATCH" => self.client.patch(&params.url),
            "HEAD" => self.client.head(&params.url),
            _ => {
                return Err(SchedulerError::validation_error(format!(
                    "不支持的HTTP方法: {method}"
                )));
            }
        };
        for (key, value) in &params.headers {
            request = request.header(key, value);
        }
        match params.body {
            Some(serde_json::Value::String(text)) => request = request.body(text),
            Some(body) => request = request.json(&body),
            None => {}
        }

        let response = tokio::select! {
            response = request.send() => response
                .map_err(|e| SchedulerError::RunnerFailure(format!("HTTP请求失败: {e}")))?,
            _ = ctx.cancellation.cancelled() => {
                return Err(SchedulerError::RunnerFailure("HTTP任务已取消".to_string()));
            }
        };

        let status = response.status();
        let body = tokio::select! {
            body = response.text() => body.map_err(|e| {
                SchedulerError::RunnerFailure(format!(
                    "读取HTTP响应体失败 (状态码 {}): {e}",
                    status.as_u16()
                ))
            })?,
            _ = ctx.cancellation.cancelled() => {
                return Err(SchedulerError::RunnerFailure("HTTP任务已取消".to_string()));
            }
        };

        if !status.is_success() {
            return Err(SchedulerError::RunnerFailure(format!(
                "HTTP请求返回状态码 {}: {}",
                status.as_u16(),
                body
            )));
        }

        Ok(serde_json::json!({
            "status_code": status.as_u16(),
            "body": body,
        }))
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsched_domain::Job;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn context(parameters: serde_json::Value) -> RunContext {
        RunContext {
            execution_id: Uuid::new_v4(),
            job: Job::new("shell-job", "shell"),
            parameters,
            cancellation: CancellationToken::new(),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = RunnerRegistry::with_builtin();
        assert_eq!(registry.job_types(), vec!["http".to_string(), "shell".to_string()]);
        assert!(registry.contains("shell"));
        assert!(matches!(
            registry.get("ftp"),
            Err(SchedulerError::RunnerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shell_rejects_bad_parameters() {
        let result = ShellRunner::new()
            .run(context(serde_json::json!({"args": ["x"]})))
            .await;
        assert!(matches!(result, Err(SchedulerError::ValidationError(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_captures_output() {
        let result = ShellRunner::new()
            .run(context(serde_json::json!({"command": "echo", "args": ["hello"]})))
            .await
            .unwrap();
        assert_eq!(result["stdout"], "hello");
        assert_eq!(result["exit_code"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_non_zero_exit_fails() {
        let result = ShellRunner::new()
            .run(context(serde_json::json!({"command": "sh", "args": ["-c", "exit 3"]})))
            .await;
        assert!(matches!(result, Err(SchedulerError::RunnerFailure(_))));
    }

    /// 返回声明长度大于实际内容的 200 响应；`hold` 为真时写完后保持连接
    async fn truncated_body_server(hold: bool) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            if hold {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
        });
        format!("http://{addr}/")
    }

    fn direct_http_runner() -> HttpRunner {
        HttpRunner::with_client(reqwest::Client::builder().no_proxy().build().unwrap())
    }

    #[tokio::test]
    async fn test_http_body_read_failure_is_runner_failure() {
        let url = truncated_body_server(false).await;
        let result = direct_http_runner()
            .run(context(serde_json::json!({"url": url})))
            .await;

        match result {
            Err(SchedulerError::RunnerFailure(message)) => {
                assert!(message.contains("读取HTTP响应体失败"), "{message}");
            }
            other => panic!("expected runner failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_cancellation_interrupts_body_read() {
        let url = truncated_body_server(true).await;
        let ctx = context(serde_json::json!({"url": url}));
        let token = ctx.cancellation.clone();
        let handle = tokio::spawn(async move { direct_http_runner().run(ctx).await });
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        token.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(SchedulerError::RunnerFailure(message)) => assert_eq!(message, "HTTP任务已取消"),
            other => panic!("expected cancellation failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_cancellation_stops_process() {
        let ctx = context(serde_json::json!({"command": "sleep", "args": ["30"]}));
        let token = ctx.cancellation.clone();
        let handle = tokio::spawn(async move { ShellRunner::new().run(ctx).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        token.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SchedulerError::RunnerFailure(_))));
    }
}
