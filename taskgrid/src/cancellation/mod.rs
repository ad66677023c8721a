//! Cooperative shutdown for long-running loops.
//!
//! The processor's timer loops and the dispatcher's HTTP server stop when
//! the shared [`CancellationToken`] is cancelled.

mod token;

pub use token::CancellationToken;
