//! Submitting side of the relay.
//!
//! - **Dispatcher**: creates the task record, then enqueues its id
//! - **Poller**: reads task state until it becomes terminal

pub mod dispatcher;
pub mod poller;

pub use dispatcher::Dispatcher;
pub use poller::{Poller, DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL};
