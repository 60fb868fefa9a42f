pub mod context;
pub mod controller;
pub mod engine;
pub mod invoker;
pub mod mapping;
pub mod react;
pub mod run_log;
pub mod scratchpad;
pub mod service;
pub mod tracker;

pub use context::ExecutionContext;
pub use controller::StageController;
pub use engine::{Engine, EngineBuilder};
pub use invoker::{StepInvoker, StepResult};
pub use react::ReActAgent;
pub use run_log::RunLogger;
pub use scratchpad::{Scratchpad, ScratchpadEntry};
pub use service::WorkflowService;
pub use tracker::ExecutionTracker;
