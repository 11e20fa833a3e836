//! 核心层：错误类型与进程退出

pub mod error;
pub mod shutdown;

pub use error::{RespawnError, SessionError};
pub use shutdown::{
    drain_controllers, run_until_shutdown, ShutdownReason, ShutdownSignal, DEFAULT_DRAIN_TIMEOUT,
};
