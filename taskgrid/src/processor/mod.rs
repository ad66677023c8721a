//! The processor side: endpoint rotation, per-endpoint conversations,
//! function execution and the timer loops driving them.

mod client;
mod endpoint;
mod executor;
mod requestor;
mod round_robin;
mod runtime;
mod schedule;

#[cfg(feature = "client")]
pub use client::HttpDispatcherClient;
pub use client::{is_not_found, DispatcherClient, LocalDispatcherClient, NOT_FOUND_STATUS};
pub use endpoint::{DispatcherEndpoint, EndpointAuth};
pub use executor::{
    execute_with_timeout, FunctionExecutor, FunctionInput, FunctionOutcome, InputValue, DEFAULT_FUNCTION_TIMEOUT,
};
pub use requestor::{DispatcherRequestor, TickOutcome, ABANDON_GRACE};
pub use round_robin::RoundRobin;
pub use runtime::ProcessorRuntime;
pub use schedule::Schedule;
