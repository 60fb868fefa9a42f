pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod expr;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use definition::{AgentSpec, ExecutorKind, InputSource, StepSpec, WorkflowDefinition};
pub use error::{ConductorError, ErrorDetail, ErrorKind, Result, ValidationIssue};
pub use event::EventBus;
pub use types::*;
