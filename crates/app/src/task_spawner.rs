use std::future::Future;
use std::pin::Pin;

use tokio::task::JoinHandle;

use protocol::{AppError, AppResult};

pub type ShareTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Background-task boundary so hosts without a live runtime fail loudly at
/// spawn time instead of panicking inside tokio.
pub trait ShareTaskSpawner: Send + Sync {
    fn spawn(&self, task_name: &'static str, task: ShareTask) -> AppResult<JoinHandle<()>>;
}

#[derive(Default)]
pub struct TokioShareTaskSpawner;

impl ShareTaskSpawner for TokioShareTaskSpawner {
    fn spawn(&self, task_name: &'static str, task: ShareTask) -> AppResult<JoinHandle<()>> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(
                AppError::new("share_runtime_unavailable", "传输后台任务运行时不可用")
                    .with_context("task", task_name),
            );
        }

        Ok(tokio::spawn(task))
    }
}

#[derive(Default)]
pub struct NoopShareTaskSpawner;

impl ShareTaskSpawner for NoopShareTaskSpawner {
    fn spawn(&self, task_name: &'static str, _task: ShareTask) -> AppResult<JoinHandle<()>> {
        Err(
            AppError::new("share_runtime_unavailable", "传输后台任务运行时不可用")
                .with_context("task", task_name),
        )
    }
}
