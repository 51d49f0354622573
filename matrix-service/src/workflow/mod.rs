pub mod models;
pub mod parser;

pub use models::{
    Defaults, EventConfig, Job, Matrix, MatrixAxis, RunDefaults, RunsOn, Step, Strategy, Trigger,
    Workflow,
};
pub use parser::WorkflowParser;
