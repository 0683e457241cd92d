//! Task records and their lifecycle.
//!
//! A [`Task`] is the unit of work and its result. Its [`TaskStatus`] only
//! moves forward:
//!
//! ```text
//! PENDING ──► PROCESSING ──► COMPLETED
//!    │             │
//!    └─────────────┴───────► FAILED
//! ```
//!
//! The store record is the single source of truth for status; nothing infers
//! status from queue position.

mod record;

pub use record::{Metadata, Task, TaskStatus, TaskView, TransitionFields};
