//! Globally synchronous stepper: one clock, gcd-sized ticks.

use tracing::info;

use crate::error::{CoordinatorError, CoordinatorResult};

use super::{ModuleEvent, SimStepper, gcd};

#[derive(Debug, Clone)]
struct ModuleNode {
    name: String,
    step_time: u64,
    passed_time: u64,
}

/// All modules share one global clock advanced by the gcd of their
/// periods; a module fires whenever its accumulated passed-time falls
/// at or behind the clock, emitting Triggered and Finished back-to-back
/// (no response latency is modeled).
///
/// An optional trigger module gates the rest: while it has not fired,
/// only it is scheduled.
#[derive(Debug, Default)]
pub struct SyncStepper {
    nodes: Vec<ModuleNode>,
    current_time: u64,
    /// gcd of the step_time of each node.
    step_time: u64,
    trigger_module: Option<ModuleNode>,
    all_modules_triggered: bool,
}

impl SyncStepper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current global tick size [ms].
    pub fn step_time(&self) -> u64 {
        self.step_time
    }

    fn recompute_step_time(&mut self) {
        self.step_time = self.nodes.iter().fold(0, |acc, n| {
            if acc == 0 { n.step_time } else { gcd(acc, n.step_time) }
        });
    }
}

impl SimStepper for SyncStepper {
    fn add_module_nodes(
        &mut self,
        name: &str,
        exec_period: u32,
        _response_time: u32,
        _group: &str,
    ) -> CoordinatorResult<()> {
        if exec_period == 0 {
            return Err(CoordinatorError::InvalidArgument(format!(
                "{name} module exec period cannot be 0"
            )));
        }
        self.nodes.push(ModuleNode {
            name: name.to_string(),
            step_time: exec_period as u64,
            passed_time: 0,
        });
        self.recompute_step_time();
        Ok(())
    }

    fn set_trigger_module(&mut self, name: &str) {
        self.trigger_module = self.nodes.iter().find(|n| n.name == name).cloned();
        debug_assert!(self.trigger_module.is_some(), "unknown trigger module {name}");
    }

    fn trigger_all_modules(&mut self) {
        self.all_modules_triggered = true;
    }

    fn remove_module(&mut self, name: &str) {
        if let Some(pos) = self.nodes.iter().position(|n| n.name == name) {
            self.nodes.remove(pos);
            self.recompute_step_time();
        }
    }

    fn reset_module_times(&mut self) {
        debug_assert!(!self.nodes.is_empty());
        self.current_time = 0;
        for n in &mut self.nodes {
            n.passed_time = 0;
        }
        self.all_modules_triggered = self.trigger_module.is_none();
        info!("coordination mode set to SYNC");
    }

    fn get_module_event(&mut self, events: &mut Vec<ModuleEvent>) -> u64 {
        if !self.all_modules_triggered {
            if let Some(trigger) = &self.trigger_module {
                events.push(ModuleEvent::triggered(&trigger.name));
                events.push(ModuleEvent::finished(&trigger.name));
                return trigger.step_time;
            }
            self.all_modules_triggered = true;
        }
        let last_event_time = self.current_time;
        let mut next_event_time = 0;
        for n in &mut self.nodes {
            if n.passed_time <= self.current_time {
                events.push(ModuleEvent::triggered(&n.name));
                events.push(ModuleEvent::finished(&n.name));
                n.passed_time += n.step_time;
            }
            next_event_time = if next_event_time == 0 {
                n.passed_time
            } else {
                next_event_time.min(n.passed_time)
            };
        }
        self.current_time = next_event_time;
        next_event_time - last_event_time
    }
}
