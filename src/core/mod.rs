//! 核心层：执行上下文、错误类型、执行监管

pub mod context;
pub mod error;
pub mod supervisor;

pub use context::ExecutionContext;
pub use error::CrewError;
pub use supervisor::ExecutionSupervisor;
