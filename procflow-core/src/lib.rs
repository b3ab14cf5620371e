//! procflow-core — a distributed workflow engine core.
//!
//! Executes graph-shaped business processes: a template describes a
//! directed graph of typed nodes (start, approval, service, exclusive,
//! parallel, cc, end); instantiating it produces a process instance
//! that advances by creating tasks, collecting decisions, and driving
//! the graph to completion.
//!
//! The crate covers the execution engine and its runtime
//! infrastructure only. Persistence, event delivery, and the
//! consistent key-value store used for coordination are consumed
//! through traits ([`store::WorkflowStore`], [`events::EventBus`],
//! [`coordinator::KvStore`]); in-memory implementations live in
//! [`store_memory`].

pub mod batcher;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod delegation;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod retry;
pub mod rules;
pub mod store;
pub mod store_memory;
pub mod template;
pub mod types;

pub use config::EngineConfig;
pub use context::ExecutionContext;
pub use engine::{
    CompleteTaskRequest, CompleteTaskResponse, ProcessEngine, StartProcessRequest,
    StartProcessResponse,
};
pub use error::{EngineError, ErrorKind, Result};
