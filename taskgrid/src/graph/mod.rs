//! The process-DAG data model.
//!
//! An [`ExecGraph`] is what a client registers; [`ExecGraph::validate`]
//! turns it into a [`ValidatedGraph`] that the task producer walks.

mod condition;
mod exec_graph;
mod process;
mod schema;

pub use condition::Condition;
pub use exec_graph::{Edge, ExecGraph, InputBinding, ValidatedGraph};
pub use process::{
    Branch, BranchContext, CachePolicy, DataSourcing, FunctionExecContext, FunctionRef, FunctionSourcing,
    ProcessDef, SubProcessLogic, SubProcesses, VariableContext, VariableDecl,
};
pub use schema::{decode_graph, encode_graph, migrate, DocumentFormat, CURRENT_GRAPH_VERSION};
