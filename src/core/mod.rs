//! 核心层：错误类型、轮次阶段、优雅关闭

pub mod error;
pub mod shutdown;
pub mod state;

pub use error::{AgentError, DispatchError, WorkError};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{PhaseReporter, RoundPhase};
