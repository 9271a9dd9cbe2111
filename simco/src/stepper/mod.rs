//! Virtual-time scheduling of module executions.
//!
//! A stepper owns per-module `(execution_period, response_time)` pairs
//! and produces, on each [`SimStepper::get_module_event`] call, the
//! advance in virtual time plus the list of Triggered/Finished events
//! occurring at the next earliest scheduled instant.
//!
//! Five algorithms implement the contract, selected by
//! [`CoordinationMode`] through [`create_sim_stepper`]:
//!
//! | mode | behavior |
//! |------|----------|
//! | Sync | one global clock advanced by the gcd of all periods |
//! | Async | event-driven, per-module periods and response latencies |
//! | Priority | async mechanics, instant-local ordering by priority key |
//! | IntergroupSync | groups synchronous, members async inside a group |
//! | IntragroupSync | members synchronous, groups async among each other |
//!
//! Within one virtual-time instant, ties resolve deterministically:
//! Triggered before Finished, ascending module name second. Scenarios
//! replay identically because of this ordering.
//!
//! Callers guarantee at least one module was added before calling
//! [`SimStepper::reset_module_times`], and a reset before the first
//! [`SimStepper::get_module_event`].

mod grouped;
mod queued;
mod sync;

use std::cmp::Ordering;

pub use grouped::{IntergroupSyncStepper, IntragroupSyncStepper};
pub use queued::{AsyncStepper, PriorityStepper};
pub use sync::SyncStepper;

use simco_common::config::CoordinationMode;

/// Kind of a scheduled module event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModuleEventType {
    /// The module's step request is dispatched at this instant.
    ExecutionTriggered,
    /// The module's step reply is collected at this instant.
    ExecutionFinished,
}

/// The atomic unit the stepper family emits; a virtual-time ordered
/// stream of these constitutes the simulation schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEvent {
    pub module_name: String,
    pub event_type: ModuleEventType,
}

impl ModuleEvent {
    pub fn new(name: impl Into<String>, event_type: ModuleEventType) -> Self {
        Self { module_name: name.into(), event_type }
    }

    pub fn triggered(name: impl Into<String>) -> Self {
        Self::new(name, ModuleEventType::ExecutionTriggered)
    }

    pub fn finished(name: impl Into<String>) -> Self {
        Self::new(name, ModuleEventType::ExecutionFinished)
    }
}

/// Common contract of the stepper family.
pub trait SimStepper: Send {
    /// Register a module. `exec_period` must be > 0; `response_time` 0
    /// means synchronous (Finished follows Triggered within the same
    /// instant), other values are clamped to the period. `group` is
    /// consulted only by the two group-sync variants.
    fn add_module_nodes(
        &mut self,
        name: &str,
        exec_period: u32,
        response_time: u32,
        group: &str,
    ) -> crate::CoordinatorResult<()>;

    /// Gate scheduling on one module: until it has fired, only it is
    /// scheduled. Not supported by the group-sync variants (no-op).
    fn set_trigger_module(&mut self, name: &str);

    /// Release the trigger gate and schedule every module.
    fn trigger_all_modules(&mut self);

    /// Remove a module (and prune its group when it ends up empty).
    fn remove_module(&mut self, name: &str);

    /// Rewind virtual time to zero and reseed the schedule.
    fn reset_module_times(&mut self);

    /// Append the events of the next earliest scheduled instant and
    /// return the advance in virtual time [ms] to the instant after it.
    fn get_module_event(&mut self, events: &mut Vec<ModuleEvent>) -> u64;
}

/// Construct the stepper matching the configured coordination mode.
pub fn create_sim_stepper(mode: CoordinationMode) -> Box<dyn SimStepper> {
    match mode {
        CoordinationMode::Sync => Box::new(SyncStepper::new()),
        CoordinationMode::Async => Box::new(AsyncStepper::new()),
        CoordinationMode::Priority => Box::new(PriorityStepper::new()),
        CoordinationMode::IntergroupSync => Box::new(IntergroupSyncStepper::new()),
        CoordinationMode::IntragroupSync => Box::new(IntragroupSyncStepper::new()),
    }
}

/// A scheduled future event, ordered for a `BinaryHeap` so that the
/// earliest instant pops first; at equal instants Triggered pops before
/// Finished (messages published and consumed at the same instant stay
/// deterministically ordered across runs), ascending module name last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FutureEvent {
    pub time_point: u64,
    pub event: ModuleEvent,
}

impl FutureEvent {
    pub fn new(name: &str, time_point: u64, event_type: ModuleEventType) -> Self {
        Self { time_point, event: ModuleEvent::new(name, event_type) }
    }
}

impl Ord for FutureEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest element, so reverse every key.
        other
            .time_point
            .cmp(&self.time_point)
            .then_with(|| other.event.event_type.cmp(&self.event.event_type))
            .then_with(|| other.event.module_name.cmp(&self.event.module_name))
    }
}

impl PartialOrd for FutureEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Greatest common divisor of two nonzero periods.
pub(crate) fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Effective response time: clamp to the period, keep 0 literal
/// (synchronous semantics).
pub(crate) fn effective_response_time(exec_period: u32, response_time: u32) -> u64 {
    (response_time.min(exec_period)) as u64
}
