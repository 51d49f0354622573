// Matrix Service Library
// Core service for parsing matrix CI workflows and running every matrix cell locally

pub mod error;
pub mod execution;
pub mod expression;
pub mod runners;
pub mod trigger;
pub mod utils;
pub mod workflow;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};

// Re-export workflow types
pub use workflow::{Job, Matrix, MatrixAxis, Step, Strategy, Trigger, Workflow, WorkflowParser};

// Re-export trigger types
pub use trigger::{GitRef, TriggerEvent, TriggerMatcher};

// Re-export expression types
pub use expression::{ExpressionContext, ExpressionEngine};

// Re-export execution types
pub use execution::{
    ExecutionEvent, ExecutorConfig, FailureKind, InstanceResult, InstanceStatus,
    IsolatedEnvironment, MatrixExpander, MatrixInstance, ProgressSender, RunPlan, RunResult,
    RunStatus, StepResult, StepStatus, WorkflowExecutor,
};

// Re-export runner types
pub use runners::{ActionRegistry, ShellRunner};
