// Execution Events
// Progress reporting and event types for workflow execution

use crate::execution::results::{FailureKind, InstanceStatus, RunStatus, StepStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during workflow execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// The event matched the workflow's triggers and instances were scheduled
    RunStarted {
        workflow_name: String,
        total_instances: usize,
        max_parallel: usize,
    },

    /// The event did not match the workflow's triggers
    RunNotTriggered {
        workflow_name: String,
        event_name: String,
        git_ref: String,
    },

    /// Every instance has finished
    RunCompleted {
        workflow_name: String,
        status: RunStatus,
        duration: Duration,
    },

    /// Instance is waiting for a concurrency permit
    InstanceQueued { job_id: String, instance: String },

    /// Instance holds its permit and is provisioning its environment
    InstanceStarted {
        job_id: String,
        instance: String,
        total_steps: usize,
    },

    /// Instance finished and released its permit
    InstanceCompleted {
        job_id: String,
        instance: String,
        status: InstanceStatus,
        failure: Option<FailureKind>,
        duration: Duration,
    },

    /// Instance was skipped (job condition evaluated to false)
    InstanceSkipped {
        job_id: String,
        instance: String,
        reason: String,
    },

    /// Step execution started
    StepStarted {
        instance: String,
        step_index: usize,
        display_name: String,
    },

    /// Step output (stdout/stderr)
    StepOutput {
        instance: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    /// Step execution completed
    StepCompleted {
        instance: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step was skipped (an earlier step failed, or its condition was false)
    StepSkipped {
        instance: String,
        step_index: usize,
        display_name: String,
        reason: String,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        instance: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    /// Create a run started event
    pub fn run_started(name: impl Into<String>, total_instances: usize, max_parallel: usize) -> Self {
        Self::RunStarted {
            workflow_name: name.into(),
            total_instances,
            max_parallel,
        }
    }

    /// Create a run completed event
    pub fn run_completed(name: impl Into<String>, status: RunStatus, duration: Duration) -> Self {
        Self::RunCompleted {
            workflow_name: name.into(),
            status,
            duration,
        }
    }

    /// Create a step output event
    pub fn step_output(
        instance: impl Into<String>,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            instance: instance.into(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, instance: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            instance,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, instance: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            instance,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, instance: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            instance,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::run_started("ci", 2, 4));
        tx.send_event(ExecutionEvent::step_output("build (3.8, 2.0.0)", 0, "hello", false));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(
            event1,
            ExecutionEvent::RunStarted {
                total_instances: 2,
                max_parallel: 4,
                ..
            }
        ));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(event2, ExecutionEvent::StepOutput { ref output, .. } if output == "hello"));
    }

    #[test]
    fn test_event_construction() {
        let event = ExecutionEvent::run_completed("ci", RunStatus::Failed, Duration::from_secs(30));

        if let ExecutionEvent::RunCompleted {
            workflow_name,
            status,
            duration,
        } = event
        {
            assert_eq!(workflow_name, "ci");
            assert_eq!(status, RunStatus::Failed);
            assert_eq!(duration, Duration::from_secs(30));
        } else {
            panic!("wrong event type");
        }
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::info("test", None));
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(ExecutionEvent::warning("nobody listening", None));
    }
}
