//! # Taskgrid
//!
//! A distributed task-graph orchestration engine.
//!
//! A dispatcher turns each registered run of a process graph into tasks,
//! hands them to polling processors and accepts their results:
//!
//! - **Graph model**: processes, their variables and the edges between them
//! - **Task production**: materializes every node whose inputs are ready
//! - **Exchange protocol**: identify, poll, report result, report status
//! - **Processors**: round-robin over dispatcher endpoints on timer loops
//! - **Variable storage**: SQLite or filesystem blobs behind one contract
//! - **Result cache**: identical (process, inputs) pairs run at most once
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use taskgrid::prelude::*;
//!
//! let dispatcher = Arc::new(Dispatcher::from_config(DispatcherConfig::default())?);
//! let graph = ExecGraph::new()
//!     .with_process(ProcessDef::new("extract", "fn.extract").with_output(VariableDecl::local("rows")))
//!     .with_process(ProcessDef::new("load", "fn.load").with_input(VariableDecl::local("rows")))
//!     .with_edge("extract", "load");
//! let run = dispatcher.register_run(graph, HashMap::new()).await?;
//!
//! let processor = ProcessorRuntime::new(
//!     ProcessorConfig::new(vec![DispatcherEndpoint::new("local")]),
//!     Arc::new(LocalDispatcherClient::new(Arc::clone(&dispatcher))),
//!     Arc::new(MyExecutor),
//! )?;
//! Arc::new(processor).run().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod processor;
pub mod producer;
pub mod storage;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheKey, ResultCache};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{DispatcherConfig, ProcessorConfig, StorageConfig};
    pub use crate::core::{
        InputLocator, RunId, RunState, Task, TaskExecState, TaskId, TaskParams, VariableId, WorkerId,
    };
    pub use crate::dispatcher::{
        Dispatcher, RequestBody, RequestEnvelope, ResponseBody, ResultReport, RunStatus,
    };
    pub use crate::errors::{
        ConfigError, ContractErrorInfo, GraphError, StorageError, StoreError, TaskgridError, TransportError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{Branch, ExecGraph, FunctionRef, ProcessDef, ValidatedGraph, VariableDecl};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::processor::{
        DispatcherClient, DispatcherEndpoint, FunctionExecutor, FunctionInput, FunctionOutcome, InputValue,
        LocalDispatcherClient, ProcessorRuntime, RoundRobin,
    };
    pub use crate::storage::{BlobArea, BlobKey, BlobStorage, VariableService};
    pub use crate::store::{InMemoryTaskStore, TaskStore};
    pub use crate::utils::{iso_timestamp, now_utc, Timestamp};
}
