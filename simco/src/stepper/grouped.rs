//! Group-composite steppers: intergroup-sync and intragroup-sync.
//!
//! Both operate on named module groups. [`IntergroupSyncStepper`] keeps
//! the groups synchronous with each other while members inside a group
//! run asynchronously; [`IntragroupSyncStepper`] keeps group members
//! synchronous with each other while distinct groups run asynchronously.
//! An ungrouped module (empty group name) forms a singleton node.

use std::collections::{BTreeMap, BinaryHeap};

use tracing::info;

use crate::error::{CoordinatorError, CoordinatorResult};

use super::{FutureEvent, ModuleEvent, ModuleEventType, SimStepper, effective_response_time};

// ─── Intergroup sync ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct SubModuleNode {
    response_time: u64,
}

/// One group advancing as a unit, with an async sub-queue inside.
#[derive(Debug, Default)]
struct AsyncGroupNode {
    name: String,
    /// Group cycle length: the largest member period.
    step_time: u64,
    passed_time: u64,
    sub_nodes: BTreeMap<String, SubModuleNode>,
    future_events: BinaryHeap<FutureEvent>,
}

impl AsyncGroupNode {
    /// Seed a Triggered event for every member at the cycle start.
    fn trigger_group(&mut self) {
        let passed = self.passed_time;
        for name in self.sub_nodes.keys() {
            self.future_events
                .push(FutureEvent::new(name, passed, ModuleEventType::ExecutionTriggered));
        }
    }

    /// Drain the group's next instant into `events`; returns whether the
    /// group's cycle has completed.
    fn get_group_module_event(&mut self, events: &mut Vec<ModuleEvent>) -> bool {
        if self.sub_nodes.is_empty() {
            // Singleton node: fires synchronously.
            events.push(ModuleEvent::triggered(&self.name));
            events.push(ModuleEvent::finished(&self.name));
            return true;
        }
        let Some(top) = self.future_events.peek() else { return true };
        let current_time = top.time_point;
        while let Some(top) = self.future_events.peek() {
            if top.time_point != current_time {
                break;
            }
            let fe = self.future_events.pop().unwrap();
            let Some(node) = self.sub_nodes.get(&fe.event.module_name).copied() else {
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
            }
        }
        self.future_events.is_empty()
    }
}

/// Groups stay synchronous with each other: a group advances its clock
/// only once every member has finished, and the global clock advances to
/// the earliest pending group cycle.
#[derive(Debug, Default)]
pub struct IntergroupSyncStepper {
    group_nodes: Vec<AsyncGroupNode>,
    current_time: u64,
}

impl IntergroupSyncStepper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SimStepper for IntergroupSyncStepper {
    fn add_module_nodes(
        &mut self,
        name: &str,
        exec_period: u32,
        response_time: u32,
        group: &str,
    ) -> CoordinatorResult<()> {
        if exec_period == 0 {
            return Err(CoordinatorError::InvalidArgument(format!(
                "{name} module exec period cannot be 0"
            )));
        }
        if group.is_empty() {
            self.group_nodes.push(AsyncGroupNode {
                name: name.to_string(),
                step_time: exec_period as u64,
                ..Default::default()
            });
            return Ok(());
        }
        let sub = SubModuleNode {
            response_time: effective_response_time(exec_period, response_time),
        };
        match self.group_nodes.iter_mut().find(|g| g.name == group) {
            Some(g) => {
                g.step_time = g.step_time.max(exec_period as u64);
                g.sub_nodes.insert(name.to_string(), sub);
            }
            None => {
                let mut g = AsyncGroupNode {
                    name: group.to_string(),
                    step_time: exec_period as u64,
                    ..Default::default()
                };
                g.sub_nodes.insert(name.to_string(), sub);
                self.group_nodes.push(g);
            }
        }
        Ok(())
    }

    fn set_trigger_module(&mut self, _name: &str) {}

    fn trigger_all_modules(&mut self) {}

    fn remove_module(&mut self, name: &str) {
        for gi in (0..self.group_nodes.len()).rev() {
            let gn = &mut self.group_nodes[gi];
            if gn.name == name && gn.sub_nodes.is_empty() {
                self.group_nodes.remove(gi);
                break;
            }
            if gn.sub_nodes.remove(name).is_some() {
                if gn.sub_nodes.is_empty() {
                    self.group_nodes.remove(gi);
                }
                break;
            }
        }
    }

    fn reset_module_times(&mut self) {
        debug_assert!(!self.group_nodes.is_empty());
        self.current_time = 0;
        for gn in &mut self.group_nodes {
            gn.passed_time = 0;
            gn.future_events.clear();
            gn.trigger_group();
        }
        info!("coordination mode set to INTERGROUP SYNC");
    }

    fn get_module_event(&mut self, events: &mut Vec<ModuleEvent>) -> u64 {
        let last_event_time = self.current_time;
        for gn in &mut self.group_nodes {
            if gn.passed_time <= self.current_time {
                if !gn.get_group_module_event(events) {
                    // Wait for the group to finish its cycle before any
                    // clock advance.
                    return 0;
                }
                gn.passed_time += gn.step_time;
                gn.trigger_group();
            }
        }
        let mut next_event_time = 0;
        for gn in &self.group_nodes {
            next_event_time = if next_event_time == 0 {
                gn.passed_time
            } else {
                next_event_time.min(gn.passed_time)
            };
        }
        self.current_time = next_event_time;
        next_event_time - last_event_time
    }
}

// ─── Intragroup sync ────────────────────────────────────────────────

/// One group firing all its members as a unit.
#[derive(Debug, Default)]
struct SyncGroupNode {
    name: String,
    exec_period: u64,
    response_time: u64,
    sub_nodes: Vec<String>,
}

impl SyncGroupNode {
    fn emit(&self, events: &mut Vec<ModuleEvent>, event_type: ModuleEventType) {
        if self.sub_nodes.is_empty() {
            events.push(ModuleEvent::new(&self.name, event_type));
        } else {
            for member in &self.sub_nodes {
                events.push(ModuleEvent::new(member, event_type));
            }
        }
    }
}

/// Group members stay synchronous with each other while distinct groups
/// run asynchronously on one shared event queue keyed by group name.
#[derive(Debug, Default)]
pub struct IntragroupSyncStepper {
    group_nodes: BTreeMap<String, SyncGroupNode>,
    future_events: BinaryHeap<FutureEvent>,
}

impl IntragroupSyncStepper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SimStepper for IntragroupSyncStepper {
    fn add_module_nodes(
        &mut self,
        name: &str,
        exec_period: u32,
        response_time: u32,
        group: &str,
    ) -> CoordinatorResult<()> {
        if exec_period == 0 {
            return Err(CoordinatorError::InvalidArgument(format!(
                "{name} module exec period cannot be 0"
            )));
        }
        let key = if group.is_empty() { name } else { group };
        let node = self.group_nodes.entry(key.to_string()).or_default();
        node.name = key.to_string();
        node.exec_period = exec_period as u64;
        node.response_time = effective_response_time(exec_period, response_time);
        if !group.is_empty() {
            node.sub_nodes.push(name.to_string());
        }
        Ok(())
    }

    fn set_trigger_module(&mut self, _name: &str) {}

    fn trigger_all_modules(&mut self) {
        let Some(top) = self.future_events.peek() else { return };
        let t = top.time_point;
        let keys: Vec<String> = self.group_nodes.keys().cloned().collect();
        for key in keys {
            self.future_events
                .push(FutureEvent::new(&key, t, ModuleEventType::ExecutionTriggered));
        }
    }

    fn remove_module(&mut self, name: &str) {
        let mut prune: Option<String> = None;
        for (key, node) in self.group_nodes.iter_mut() {
            if key == name && node.sub_nodes.is_empty() {
                prune = Some(key.clone());
                break;
            }
            if let Some(pos) = node.sub_nodes.iter().position(|m| m == name) {
                node.sub_nodes.remove(pos);
                if node.sub_nodes.is_empty() {
                    prune = Some(key.clone());
                }
                break;
            }
        }
        if let Some(key) = prune {
            self.group_nodes.remove(&key);
        }
    }

    fn reset_module_times(&mut self) {
        debug_assert!(!self.group_nodes.is_empty());
        self.future_events.clear();
        for key in self.group_nodes.keys() {
            self.future_events
                .push(FutureEvent::new(key, 0, ModuleEventType::ExecutionTriggered));
        }
        info!("coordination mode set to INTRAGROUP SYNC");
    }

    fn get_module_event(&mut self, events: &mut Vec<ModuleEvent>) -> u64 {
        let Some(top) = self.future_events.peek() else { return 0 };
        let current_time = top.time_point;
        while let Some(top) = self.future_events.peek() {
            if top.time_point != current_time {
                break;
            }
            let fe = self.future_events.pop().unwrap();
            let Some(node) = self.group_nodes.get(&fe.event.module_name) else {
                continue;
            };
            node.emit(events, fe.event.event_type);
            if fe.event.event_type == ModuleEventType::ExecutionTriggered {
                let (key, response, period) = (node.name.clone(), node.response_time, node.exec_period);
                self.future_events.push(FutureEvent::new(
                    &key,
                    current_time + response,
                    ModuleEventType::ExecutionFinished,
                ));
                self.future_events.push(FutureEvent::new(
                    &key,
                    current_time + period,
                    ModuleEventType::ExecutionTriggered,
                ));
            }
        }
        self.future_events
            .peek()
            .map_or(0, |e| e.time_point - current_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triggered(events: &[ModuleEvent]) -> Vec<&str> {
        events
            .iter()
            .filter(|e| e.event_type == ModuleEventType::ExecutionTriggered)
            .map(|e| e.module_name.as_str())
            .collect()
    }

    // ── IntergroupSyncStepper ──

    #[test]
    fn groups_advance_in_lockstep() {
        let mut s = IntergroupSyncStepper::new();
        s.add_module_nodes("a", 10, 0, "g1").unwrap();
        s.add_module_nodes("b", 10, 0, "g1").unwrap();
        s.add_module_nodes("c", 20, 0, "").unwrap();
        s.reset_module_times();

        // t=0: both members of g1 fire, the singleton c fires.
        let mut events = Vec::new();
        let advance = s.get_module_event(&mut events);
        assert_eq!(advance, 10);
        let t = triggered(&events);
        assert!(t.contains(&"a") && t.contains(&"b") && t.contains(&"c"));

        // t=10: only g1 is due.
        events.clear();
        let advance = s.get_module_event(&mut events);
        assert_eq!(advance, 10);
        let t = triggered(&events);
        assert!(t.contains(&"a") && !t.contains(&"c"));
    }

    #[test]
    fn group_with_latency_blocks_the_clock_until_finished() {
        let mut s = IntergroupSyncStepper::new();
        s.add_module_nodes("a", 10, 5, "g1").unwrap();
        s.reset_module_times();

        let mut events = Vec::new();
        // Triggered pops first; the cycle is not finished yet.
        let advance = s.get_module_event(&mut events);
        assert_eq!(advance, 0);
        assert_eq!(events, vec![ModuleEvent::triggered("a")]);

        // The pending Finished drains and the group cycle completes.
        events.clear();
        let advance = s.get_module_event(&mut events);
        assert_eq!(advance, 10);
        assert_eq!(events, vec![ModuleEvent::finished("a")]);
    }

    #[test]
    fn group_step_time_is_largest_member_period() {
        let mut s = IntergroupSyncStepper::new();
        s.add_module_nodes("a", 10, 0, "g").unwrap();
        s.add_module_nodes("b", 30, 0, "g").unwrap();
        s.reset_module_times();
        let mut events = Vec::new();
        assert_eq!(s.get_module_event(&mut events), 30);
    }

    #[test]
    fn removing_last_member_prunes_the_group() {
        let mut s = IntergroupSyncStepper::new();
        s.add_module_nodes("a", 10, 0, "g").unwrap();
        s.add_module_nodes("c", 20, 0, "").unwrap();
        s.remove_module("a");
        s.reset_module_times();
        let mut events = Vec::new();
        s.get_module_event(&mut events);
        assert!(events.iter().all(|e| e.module_name == "c"));
    }

    #[test]
    fn intergroup_zero_period_rejected() {
        let mut s = IntergroupSyncStepper::new();
        assert!(s.add_module_nodes("a", 0, 0, "g").is_err());
    }

    // ── IntragroupSyncStepper ──

    #[test]
    fn members_fire_together_groups_run_apart() {
        let mut s = IntragroupSyncStepper::new();
        s.add_module_nodes("a", 20, 0, "g1").unwrap();
        s.add_module_nodes("b", 20, 0, "g1").unwrap();
        s.add_module_nodes("c", 50, 0, "").unwrap();
        s.reset_module_times();

        // t=0: everything fires.
        let mut events = Vec::new();
        let advance = s.get_module_event(&mut events);
        assert_eq!(advance, 20);
        let t = triggered(&events);
        assert!(t.contains(&"a") && t.contains(&"b") && t.contains(&"c"));

        // t=20: only g1; its members fire as a unit.
        events.clear();
        let advance = s.get_module_event(&mut events);
        assert_eq!(triggered(&events), vec!["a", "b"]);
        assert_eq!(advance, 20);

        // t=40: g1 again; next instant is c's at 50.
        events.clear();
        let advance = s.get_module_event(&mut events);
        assert_eq!(triggered(&events), vec!["a", "b"]);
        assert_eq!(advance, 10);

        // t=50: c alone.
        events.clear();
        let advance = s.get_module_event(&mut events);
        assert_eq!(triggered(&events), vec!["c"]);
        assert_eq!(advance, 10);
    }

    #[test]
    fn removing_members_then_group() {
        let mut s = IntragroupSyncStepper::new();
        s.add_module_nodes("a", 20, 0, "g1").unwrap();
        s.add_module_nodes("b", 20, 0, "g1").unwrap();
        s.add_module_nodes("c", 20, 0, "").unwrap();
        s.remove_module("a");
        s.remove_module("b"); // group g1 now empty and pruned
        s.reset_module_times();
        let mut events = Vec::new();
        s.get_module_event(&mut events);
        assert!(events.iter().all(|e| e.module_name == "c"));
    }

    #[test]
    fn intragroup_zero_period_rejected() {
        let mut s = IntragroupSyncStepper::new();
        assert!(s.add_module_nodes("a", 0, 0, "").is_err());
    }
}
