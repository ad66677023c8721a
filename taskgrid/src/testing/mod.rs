//! Testing utilities for taskgrid.
//!
//! This module provides:
//! - Graph fixtures (linear chains, parallel fan-out, cached processes)
//! - Function executors with scripted behavior
//! - A dispatcher over in-memory storage
//! - Assertions over task and run state

mod assertions;
mod executors;
mod fixtures;

pub use assertions::{assert_run_state, assert_states};
pub use executors::{CountingExecutor, EchoExecutor, FailingExecutor, SlowExecutor};
pub use fixtures::{
    cached_graph, cached_process, filesystem_dispatcher, in_memory_dispatcher, in_memory_dispatcher_with_events, linear_graph,
    parallel_graph, sample_params,
};
