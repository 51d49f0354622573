// Execution Engine Module
// Handles matrix expansion, isolated environments, and run orchestration

pub mod context;
pub mod environment;
pub mod events;
pub mod executor;
pub mod matrix;
pub mod results;

// Re-export key types
pub use context::RuntimeContext;
pub use environment::{CommandFiles, IsolatedEnvironment};
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::{default_env_root, ExecutorConfig, WorkflowExecutor, DEFAULT_MAX_PARALLEL};
pub use matrix::{MatrixExpander, MatrixInstance};
pub use results::{
    FailureKind, InstanceResult, InstanceStatus, PlannedJob, RunPlan, RunResult, RunStatus,
    StepResult, StepStatus,
};
