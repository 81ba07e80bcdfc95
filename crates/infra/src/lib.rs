pub mod logging;
pub mod receipt;

pub use protocol::{AppError, AppResult, ResultExt};
