//! Event-queue driven steppers: Async and Priority.

use std::collections::{BTreeMap, BinaryHeap};

use tracing::info;

use crate::error::{CoordinatorError, CoordinatorResult};

use super::{FutureEvent, ModuleEvent, ModuleEventType, SimStepper, effective_response_time};

#[derive(Debug, Clone, Copy)]
struct ModuleNode {
    exec_period: u64,
    response_time: u64,
}

/// Event-driven stepper. Each module runs on its own period with a
/// modeled response latency: Triggered at `t` schedules Finished at
/// `t + response_time` and the next Triggered at `t + period`.
///
/// A `response_time` of 0 keeps the module synchronous: its Finished
/// event lands in the same instant as the Triggered one and the pair is
/// emitted back-to-back.
#[derive(Debug, Default)]
pub struct AsyncStepper {
    nodes: BTreeMap<String, ModuleNode>,
    future_events: BinaryHeap<FutureEvent>,
    trigger_module: String,
}

impl AsyncStepper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SimStepper for AsyncStepper {
    fn add_module_nodes(
        &mut self,
        name: &str,
        exec_period: u32,
        response_time: u32,
        _group: &str,
    ) -> CoordinatorResult<()> {
        if exec_period == 0 {
            return Err(CoordinatorError::InvalidArgument(format!(
                "{name} module exec period cannot be 0"
            )));
        }
        self.nodes.insert(
            name.to_string(),
            ModuleNode {
                exec_period: exec_period as u64,
                response_time: effective_response_time(exec_period, response_time),
            },
        );
        Ok(())
    }

    fn set_trigger_module(&mut self, name: &str) {
        debug_assert!(self.nodes.contains_key(name), "unknown trigger module {name}");
        self.trigger_module = name.to_string();
    }

    fn trigger_all_modules(&mut self) {
        let Some(top) = self.future_events.peek() else { return };
        let t = if top.event.event_type == ModuleEventType::ExecutionTriggered {
            top.time_point
        } else {
            let response = self
                .nodes
                .get(&self.trigger_module)
                .map_or(0, |n| n.response_time);
            top.time_point - response
        };
        let seeds: Vec<String> = self
            .nodes
            .keys()
            .filter(|n| **n != self.trigger_module)
            .cloned()
            .collect();
        for name in seeds {
            self.future_events
                .push(FutureEvent::new(&name, t, ModuleEventType::ExecutionTriggered));
        }
    }

    fn remove_module(&mut self, name: &str) {
        self.nodes.remove(name);
    }

    fn reset_module_times(&mut self) {
        debug_assert!(!self.nodes.is_empty());
        self.future_events.clear();
        if self.trigger_module.is_empty() {
            for name in self.nodes.keys() {
                self.future_events
                    .push(FutureEvent::new(name, 0, ModuleEventType::ExecutionTriggered));
            }
        } else {
            self.future_events.push(FutureEvent::new(
                &self.trigger_module,
                0,
                ModuleEventType::ExecutionTriggered,
            ));
        }
        info!("coordination mode set to ASYNC");
    }

    fn get_module_event(&mut self, events: &mut Vec<ModuleEvent>) -> u64 {
        let Some(top) = self.future_events.peek() else { return 0 };
        let current_time = top.time_point;
        while let Some(top) = self.future_events.peek() {
            if top.time_point != current_time {
                break;
            }
            let fe = self.future_events.pop().unwrap();
            // Events of removed modules may still sit in the queue.
            let Some(node) = self.nodes.get(&fe.event.module_name).copied() else {
                continue;
            };
            let name = fe.event.module_name.clone();
            let is_triggered = fe.event.event_type == ModuleEventType::ExecutionTriggered;
            events.push(fe.event);
            if is_triggered {
                self.future_events.push(FutureEvent::new(
                    &name,
                    current_time + node.response_time,
                    ModuleEventType::ExecutionFinished,
                ));
                self.future_events.push(FutureEvent::new(
                    &name,
                    current_time + node.exec_period,
                    ModuleEventType::ExecutionTriggered,
                ));
            }
        }
        self.future_events
            .peek()
            .map_or(0, |e| e.time_point - current_time)
    }
}

/// Async queue mechanics with instant-local execution ordering: events
/// landing on the same instant are grouped by `response_time` acting as
/// a priority key, all Triggered events emitted in ascending key order,
/// then all Finished events — execution-order control independent of
/// wall-clock arrival.
#[derive(Debug, Default)]
pub struct PriorityStepper {
    nodes: BTreeMap<String, ModuleNode>,
    future_events: BinaryHeap<FutureEvent>,
    trigger_module: String,
}

impl PriorityStepper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SimStepper for PriorityStepper {
    fn add_module_nodes(
        &mut self,
        name: &str,
        exec_period: u32,
        response_time: u32,
        _group: &str,
    ) -> CoordinatorResult<()> {
        if exec_period == 0 {
            return Err(CoordinatorError::InvalidArgument(format!(
                "{name} module exec period cannot be 0"
            )));
        }
        self.nodes.insert(
            name.to_string(),
            ModuleNode {
                exec_period: exec_period as u64,
                // The priority key, kept verbatim.
                response_time: response_time as u64,
            },
        );
        Ok(())
    }

    fn set_trigger_module(&mut self, name: &str) {
        debug_assert!(self.nodes.contains_key(name), "unknown trigger module {name}");
        self.trigger_module = name.to_string();
    }

    fn trigger_all_modules(&mut self) {
        let Some(top) = self.future_events.peek() else { return };
        let t = top.time_point;
        let seeds: Vec<String> = self
            .nodes
            .keys()
            .filter(|n| **n != self.trigger_module)
            .cloned()
            .collect();
        for name in seeds {
            self.future_events
                .push(FutureEvent::new(&name, t, ModuleEventType::ExecutionTriggered));
        }
    }

    fn remove_module(&mut self, name: &str) {
        self.nodes.remove(name);
    }

    fn reset_module_times(&mut self) {
        debug_assert!(!self.nodes.is_empty());
        self.future_events.clear();
        if self.trigger_module.is_empty() {
            for name in self.nodes.keys() {
                self.future_events
                    .push(FutureEvent::new(name, 0, ModuleEventType::ExecutionTriggered));
            }
        } else {
            self.future_events.push(FutureEvent::new(
                &self.trigger_module,
                0,
                ModuleEventType::ExecutionTriggered,
            ));
        }
        info!("coordination mode set to PRIORITY");
    }

    fn get_module_event(&mut self, events: &mut Vec<ModuleEvent>) -> u64 {
        let Some(top) = self.future_events.peek() else { return 0 };
        let current_time = top.time_point;
        // Priority key -> module names, pop order within a key.
        let mut priority_groups: BTreeMap<u64, Vec<String>> = BTreeMap::new();
        while let Some(top) = self.future_events.peek() {
            if top.time_point != current_time {
                break;
            }
            let fe = self.future_events.pop().unwrap();
            let Some(node) = self.nodes.get(&fe.event.module_name).copied() else {
                continue;
            };
            let name = fe.event.module_name;
            priority_groups.entry(node.response_time).or_default().push(name.clone());
            // One tick marker per module; the event type carries no
            // meaning in this stepper.
            self.future_events.push(FutureEvent::new(
                &name,
                current_time + node.exec_period,
                ModuleEventType::ExecutionTriggered,
            ));
        }

        for names in priority_groups.values() {
            for name in names {
                events.push(ModuleEvent::triggered(name));
            }
        }
        for names in priority_groups.values() {
            for name in names {
                events.push(ModuleEvent::finished(name));
            }
        }

        self.future_events
            .peek()
            .map_or(0, |e| e.time_point - current_time)
    }
}
