//! Executor: the narrow interface between an approved request and the
//! sandbox/credential set that actually runs it (§9). The pipeline and
//! dispatcher never shell out directly; they go through this trait so the
//! approval logic stays testable without a real subprocess.

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("executor transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub command: String,
    pub account_id: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError>;
}

/// Test double returning a canned, configurable result instead of
/// shelling out.
pub struct FakeExecutor {
    pub result: ExecutionResult,
    pub calls: Mutex<Vec<ExecutionRequest>>,
}

impl FakeExecutor {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            result: ExecutionResult {
                stdout: stdout.into(),
                stderr: String::new(),
                exit_code: 0,
                execution_time_ms: 5,
            },
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        self.calls.lock().unwrap().push(request);
        Ok(self.result.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_executor_replays_canned_result() {
        let executor = FakeExecutor::ok("listing");
        let result = executor
            .execute(ExecutionRequest {
                command: "aws s3 ls".into(),
                account_id: "acct".into(),
            })
            .await
            .unwrap();
        assert_eq!(result.stdout, "listing");
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
    }
}
