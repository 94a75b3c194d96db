//! Orchestration for containerized test runs: compose lifecycle, exec
//! transports, user reconciliation and the execution engine itself.

pub mod compose;
pub mod config;
pub mod process;
pub mod retry;
pub mod runner;
pub mod transport;
pub mod users;

pub use compose::{
    assemble_files, resolve_tool, CleanupCoordinator, CleanupOptions, ComposeStack, ComposeTool,
    ShutdownReason,
};
pub use config::RunConfig;
pub use retry::RetryPolicy;
pub use runner::{RunOutcome, TestExecutionEngine};
pub use transport::{DockerExec, ExecSpec, ExecStatus, ExecTransport, HttpExec};
