//! # Simco Coordinator
//!
//! Drives a fixed set of independently-executing module processes
//! (planning, control, perception, ...) through a deterministic,
//! repeatable simulation timeline. Module crashes, slow responses and
//! dynamic reconnection are routine events, not exceptions.
//!
//! # Module Structure
//!
//! - [`stepper`] - Pluggable virtual-time scheduling algorithms
//! - [`registry`] - Registration/heartbeat service modules call into
//! - [`reaper`] - Asynchronous child-process exit-status collection
//! - [`process`] - Process spawning and termination service
//! - [`connection`] - Non-blocking request/reply channel per module
//! - [`module_mgr`] - Process launch, reuse and failure monitoring
//! - [`coordinator`] - The command execution loop composing the rest

pub mod connection;
pub mod coordinator;
pub mod error;
pub mod module_mgr;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod stepper;

pub use error::{CoordinatorError, CoordinatorResult};
