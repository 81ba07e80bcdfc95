mod service;
pub mod task_spawner;

pub use service::{ShareService, default_share_settings};
pub use task_spawner::{NoopShareTaskSpawner, ShareTask, ShareTaskSpawner, TokioShareTaskSpawner};

pub use protocol::{AppError, AppResult, ResultExt};
pub use server::{NoopShareEventSink, ShareEventSink};
