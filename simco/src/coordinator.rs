//! The command execution loop.
//!
//! A [`Coordinator`] composes the module manager (and transitively the
//! registry and reaper), a stepper, the shared-memory pool and the
//! module connections into a state machine over the commands
//! {Setup, Reset, Step, Run, Pause, Stop, UnSetup}.
//!
//! Commands serialize on one state mutex. `is_cmd_executing`, `pause`
//! and `un_setup` are atomics readable without the lock, so a
//! concurrently running play thread observes a cancel request within
//! one step tick — a module is never killed mid-request.
//!
//! Step-timeout policy is explicit: a module's reply may be awaited at
//! most `max_forcing_timeout_ms` past its dispatch; past that bound the
//! step resolves as timed out, the module is marked
//! `last_step_timed_out` and excluded from the Stop exchange.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use simco_common::config::{ConfigLoader, CoordinatorConfig, ModuleConfig};
use simco_common::status::{
    CmdErrorCode, Command, CommandStatus, ModuleCmdStatus, ModuleInitState, ModulePerfStats,
    ModuleResponseType, TopicPubSubInfo,
};
use simco_common::wire::{ModuleRequest, ModuleResponse, ResetParams, StepRequest};
use simco_shm::ShmemPool;

use crate::module_mgr::ModuleManager;
use crate::stepper::{ModuleEventType, SimStepper, create_sim_stepper};

/// Interval between keep-alive callbacks while waiting on a module.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(1_000);

/// Interval between init-workflow monitoring passes.
const SETUP_MONITOR_INTERVAL: Duration = Duration::from_millis(50);

/// Callback streaming intermediate command statuses to an external
/// status writer.
pub type CommandStatusCb = Arc<dyn Fn(&CommandStatus) + Send + Sync>;

/// Everything one command execution needs.
#[derive(Clone)]
pub struct CommandInfo {
    pub cmd: Command,
    pub status_cb: Option<CommandStatusCb>,
    /// Extra key/value init parameters merged into every module's init
    /// args for this run.
    pub extra_init_params: Vec<(String, String)>,
    pub reset_params: ResetParams,
    /// Inline input payloads fed into the topic board before stepping.
    pub input_msgs: HashMap<String, Vec<u8>>,
    /// Bound on init monitoring passes during Setup; 0 means no bound.
    pub max_setup_monitoring_count: usize,
}

impl CommandInfo {
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            status_cb: None,
            extra_init_params: Vec::new(),
            reset_params: ResetParams::default(),
            input_msgs: HashMap::new(),
            max_setup_monitoring_count: 0,
        }
    }

    fn callback(&self, status: &CommandStatus) {
        if let Some(cb) = &self.status_cb {
            cb(status);
        }
    }
}

/// How a topic payload travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicKind {
    Inline,
    Shmem { size: usize },
}

#[derive(Debug, Clone)]
struct TopicMeta {
    name: String,
    kind: TopicKind,
}

/// Per-run mutable state of one module. Created at Setup, destroyed at
/// Stop/UnSetup. Exactly one instance per active module name.
struct ModulePlayContext {
    config: ModuleConfig,
    sub_topics: Vec<TopicMeta>,
    pub_topics: Vec<TopicMeta>,
    has_outstanding_step_request: bool,
    last_step_timed_out: bool,
    perf: ModulePerfStats,
}

impl ModulePlayContext {
    fn new(config: ModuleConfig) -> Self {
        let perf = ModulePerfStats { name: config.name.clone(), ..Default::default() };
        Self {
            config,
            sub_topics: Vec::new(),
            pub_topics: Vec::new(),
            has_outstanding_step_request: false,
            last_step_timed_out: false,
            perf,
        }
    }
}

/// Mutable orchestration state, owned by whichever thread holds the
/// command mutex.
struct PlayState {
    config_loader: Box<dyn ConfigLoader>,
    module_mgr: Box<dyn ModuleManager>,
    stepper: Option<Box<dyn SimStepper>>,
    shmem_pool: Option<ShmemPool>,
    current_config: Option<CoordinatorConfig>,
    modules: BTreeMap<String, ModulePlayContext>,
    /// Topic board holding the most recent inline payload per topic.
    messages: HashMap<String, Vec<u8>>,
    sim_time: u64,
    scenario_set: bool,
    scenario_started: bool,
}

struct CoordinatorShared {
    state: Mutex<PlayState>,
    is_cmd_executing: AtomicBool,
    pause: AtomicBool,
    un_setup: AtomicBool,
    sim_time: AtomicU64,
    current_scenario: Mutex<String>,
}

/// The orchestration root.
pub struct Coordinator {
    shared: Arc<CoordinatorShared>,
    play_thread: Mutex<Option<JoinHandle<CommandStatus>>>,
}

impl Coordinator {
    pub fn new(config_loader: Box<dyn ConfigLoader>, module_mgr: Box<dyn ModuleManager>) -> Self {
        let state = PlayState {
            config_loader,
            module_mgr,
            stepper: None,
            shmem_pool: None,
            current_config: None,
            modules: BTreeMap::new(),
            messages: HashMap::new(),
            sim_time: 0,
            scenario_set: false,
            scenario_started: true,
        };
        Self {
            shared: Arc::new(CoordinatorShared {
                state: Mutex::new(state),
                is_cmd_executing: AtomicBool::new(false),
                pause: AtomicBool::new(false),
                un_setup: AtomicBool::new(false),
                sim_time: AtomicU64::new(0),
                current_scenario: Mutex::new(String::new()),
            }),
            play_thread: Mutex::new(None),
        }
    }

    pub fn is_cmd_executing(&self) -> bool {
        self.shared.is_cmd_executing.load(Ordering::Acquire)
    }

    pub fn current_scenario(&self) -> String {
        self.shared.current_scenario.lock().clone()
    }

    pub fn current_simulation_time(&self) -> u64 {
        self.shared.sim_time.load(Ordering::Acquire)
    }

    /// Execute one command. `async_run` detaches `Run` onto a play
    /// thread and returns `Accepted` immediately.
    pub fn execute(&self, cmd_info: CommandInfo, async_run: bool) -> CmdErrorCode {
        if let Some(ec) = self.check_cmd_state(cmd_info.cmd) {
            return ec;
        }
        let shared = &self.shared;
        match cmd_info.cmd {
            Command::Pause => {
                shared.pause.store(true, Ordering::Release);
                CmdErrorCode::Succeed
            }
            Command::UnSetup | Command::Stop => {
                shared.un_setup.store(true, Ordering::Release);
                // Waits here until a running play loop observed the
                // flag and released the state.
                let mut state = shared.state.lock();
                let mut status = CommandStatus::new(CmdErrorCode::Accepted);
                shared.stop_scenario(&mut state, &mut status, &cmd_info);
                if cmd_info.cmd == Command::UnSetup {
                    shared.un_setup_scenario(&mut state);
                }
                shared.un_setup.store(false, Ordering::Release);
                shared.pause.store(false, Ordering::Release);
                cmd_info.callback(&status);
                status.code()
            }
            Command::Setup => {
                let mut state = shared.state.lock();
                shared.is_cmd_executing.store(true, Ordering::Release);
                let mut status = CommandStatus::new(CmdErrorCode::Accepted);
                shared.setup_scenario(&mut state, &mut status, &cmd_info);
                shared.is_cmd_executing.store(false, Ordering::Release);
                cmd_info.callback(&status);
                status.code()
            }
            Command::Reset => {
                let mut state = shared.state.lock();
                let mut status = CommandStatus::new(CmdErrorCode::Accepted);
                shared.reset_modules(&mut state, &mut status, &cmd_info);
                cmd_info.callback(&status);
                status.code()
            }
            Command::Step => {
                shared.pause.store(false, Ordering::Release);
                let mut state = shared.state.lock();
                shared.is_cmd_executing.store(true, Ordering::Release);
                let mut status = CommandStatus::new(CmdErrorCode::Succeed);
                shared.step(&mut state, &mut status, &cmd_info);
                shared.is_cmd_executing.store(false, Ordering::Release);
                cmd_info.callback(&status);
                status.code()
            }
            Command::Run => {
                shared.pause.store(false, Ordering::Release);
                if async_run {
                    let shared = Arc::clone(&self.shared);
                    let thread = std::thread::Builder::new()
                        .name("simco-play".to_string())
                        .spawn(move || shared.run_play_loop(cmd_info));
                    match thread {
                        Ok(handle) => {
                            *self.play_thread.lock() = Some(handle);
                            CmdErrorCode::Accepted
                        }
                        Err(e) => {
                            error!("spawning play thread failed: {e}");
                            CmdErrorCode::SystemError
                        }
                    }
                } else {
                    self.shared.run_play_loop(cmd_info).code()
                }
            }
        }
    }

    /// Wait for an asynchronous Run to end and return its final status.
    pub fn join_run(&self) -> Option<CommandStatus> {
        let handle = self.play_thread.lock().take()?;
        handle.join().ok()
    }

    fn check_cmd_state(&self, cmd: Command) -> Option<CmdErrorCode> {
        if self.is_cmd_executing() && !cmd.is_cancel() && cmd != Command::Stop {
            warn!(?cmd, "another command is executing, rejected");
            return Some(CmdErrorCode::Rejected);
        }
        if matches!(cmd, Command::Step | Command::Run) && !self.shared.state.lock().scenario_set {
            warn!(?cmd, "no scenario set up, rejected");
            return Some(CmdErrorCode::Rejected);
        }
        None
    }
}

impl CoordinatorShared {
    // ─── Run ────────────────────────────────────────────────────────

    fn run_play_loop(&self, cmd_info: CommandInfo) -> CommandStatus {
        self.is_cmd_executing.store(true, Ordering::Release);
        let mut state = self.state.lock();
        let mut status = CommandStatus::default();
        let step_cmd = CommandInfo { cmd: Command::Step, ..cmd_info.clone() };

        loop {
            if self.pause.load(Ordering::Acquire) || self.un_setup.load(Ordering::Acquire) {
                info!("run loop cancelled");
                break;
            }
            let step_start = Instant::now();
            status.clear();
            let advance = self.step(&mut state, &mut status, &step_cmd);
            cmd_info.callback(&status);
            // Errors end the run only through the auto-stop policy,
            // which tears the scenario down inside step().
            if !state.scenario_set {
                break;
            }
            // Pace virtual time against the wall clock.
            let budget = Duration::from_millis(advance);
            let elapsed = step_start.elapsed();
            if elapsed < budget {
                std::thread::sleep(budget - elapsed);
            }
        }

        info!(total_sim_time = state.sim_time, "run finished");
        self.is_cmd_executing.store(false, Ordering::Release);
        status
    }

    // ─── Setup ──────────────────────────────────────────────────────

    fn setup_scenario(
        &self,
        state: &mut PlayState,
        status: &mut CommandStatus,
        cmd_info: &CommandInfo,
    ) {
        self.un_setup_scenario(state);

        // Apply configuration.
        let mut config = match state.config_loader.load() {
            Ok(c) => c,
            Err(e) => {
                error!("configuration loading failed: {e}");
                status.apply_err_code(CmdErrorCode::InvalidModuleConfig);
                status
                    .module_status
                    .push(ModuleCmdStatus::new("", ModuleResponseType::Error, e.to_string()));
                return;
            }
        };
        for module in &mut config.module_configs {
            for (k, v) in &cmd_info.extra_init_params {
                module.init_args.insert(k.clone(), v.clone());
            }
        }
        state.module_mgr.update_configs(&config);
        state.current_config = Some(config);

        // Monitor the init workflow until every module terminates it.
        let init_info = match self.monitor_module_setup(state, status, cmd_info) {
            Some(info) => info,
            None => return, // cancelled or timed out; status already set
        };

        // Build play contexts and wire topics for succeeded modules.
        let config = state.current_config.as_ref().expect("configuration was just applied");
        let mode = config.coord_mode;
        let trigger = config.trigger_module.clone();
        let module_configs: Vec<ModuleConfig> = config.module_configs.clone();
        let mut pool = ShmemPool::new();
        let mut stepper = create_sim_stepper(mode);

        let mut any_ready = false;
        for mc in module_configs {
            let Some((init_state, topic_info)) = init_info.get(&mc.name) else { continue };
            if *init_state != ModuleInitState::Succeed {
                continue;
            }
            if let Err(e) =
                stepper.add_module_nodes(&mc.name, mc.exec_period_ms, mc.response_time_ms, &mc.group)
            {
                error!(module = %mc.name, "stepper rejected module: {e}");
                status.apply_err_code(CmdErrorCode::InvalidModuleConfig);
                return;
            }
            let mut ctx = ModulePlayContext::new(mc.clone());
            for t in &topic_info.sub_topics {
                ctx.sub_topics.push(TopicMeta { name: t.clone(), kind: TopicKind::Inline });
            }
            for t in &topic_info.sub_shmems {
                ctx.sub_topics
                    .push(TopicMeta { name: t.clone(), kind: TopicKind::Shmem { size: 0 } });
            }
            for t in &topic_info.pub_topics {
                ctx.pub_topics.push(TopicMeta { name: t.clone(), kind: TopicKind::Inline });
            }
            for (t, size) in &topic_info.pub_shmems {
                pool.add_shmem_pub_info(t, *size);
                ctx.pub_topics
                    .push(TopicMeta { name: t.clone(), kind: TopicKind::Shmem { size: *size } });
            }
            state.modules.insert(mc.name.clone(), ctx);
            any_ready = true;
        }

        if !any_ready {
            error!("no module reached a ready state, setup failed");
            status.apply_err_code(CmdErrorCode::Failed);
            return;
        }

        if let Err(e) = pool.update_shmem_pubs() {
            error!("shared memory reconciliation failed: {e}");
            status.apply_err_code(CmdErrorCode::SystemError);
            return;
        }
        state.shmem_pool = Some(pool);

        if let Some(trigger) = &trigger {
            if state.modules.contains_key(trigger) {
                stepper.set_trigger_module(trigger);
                state.scenario_started = false;
            }
        }
        stepper.reset_module_times();
        state.stepper = Some(stepper);

        // Reset phase: broadcast the scenario to every ready module.
        self.reset_modules(state, status, cmd_info);
        if status.code() > CmdErrorCode::Succeed {
            return;
        }

        state.scenario_set = true;
        *self.current_scenario.lock() = cmd_info.reset_params.scenario_path.clone();
        if status.code() == CmdErrorCode::Accepted {
            status.apply_err_code(CmdErrorCode::Succeed);
        }
        info!(scenario = %cmd_info.reset_params.scenario_path, "scenario set up");
    }

    /// Poll the init workflow until all modules finished, the pass
    /// bound is hit, or a cancel arrives. Returns the terminal
    /// `(state, topics)` per module, or None when setup must abort.
    #[allow(clippy::type_complexity)]
    fn monitor_module_setup(
        &self,
        state: &mut PlayState,
        status: &mut CommandStatus,
        cmd_info: &CommandInfo,
    ) -> Option<HashMap<String, (ModuleInitState, TopicPubSubInfo)>> {
        let total = state.current_config.as_ref().map_or(0, |c| c.module_configs.len());
        let mut collected: HashMap<String, (ModuleInitState, TopicPubSubInfo)> = HashMap::new();
        let mut passes = 0usize;
        loop {
            if self.un_setup.load(Ordering::Acquire) {
                warn!("setup cancelled");
                status.apply_err_code(CmdErrorCode::ScenarioStopped);
                return None;
            }
            let mut events = Vec::new();
            let mut cmd_st = Vec::new();
            let finished = state.module_mgr.monitor_init_workflow(&mut events, &mut cmd_st);
            for ev in events {
                if ev.state.is_terminal() {
                    collected.insert(ev.name.clone(), (ev.state, ev.topic_info.clone()));
                }
                status.init_status.push(ev);
            }
            status.module_status.extend(cmd_st);
            if finished >= total {
                break;
            }
            passes += 1;
            if cmd_info.max_setup_monitoring_count > 0
                && passes >= cmd_info.max_setup_monitoring_count
            {
                error!("module setup monitoring exceeded its bound");
                status.apply_err_code(CmdErrorCode::ScenarioTimeout);
                return None;
            }
            if passes % 20 == 0 {
                cmd_info.callback(&CommandStatus::new(CmdErrorCode::Accepted));
            }
            std::thread::sleep(SETUP_MONITOR_INTERVAL);
        }

        let failed = collected.values().filter(|(s, _)| *s == ModuleInitState::Failed).count();
        if failed > 0 {
            // The run continues on the surviving modules; the caller
            // fails the setup only when nothing survived.
            warn!(failed, total, "modules failed to initialize");
        }
        Some(collected)
    }

    // ─── Reset ──────────────────────────────────────────────────────

    fn reset_modules(
        &self,
        state: &mut PlayState,
        status: &mut CommandStatus,
        cmd_info: &CommandInfo,
    ) {
        let request = ModuleRequest::Reset(cmd_info.reset_params.clone());
        let names: Vec<String> = state.modules.keys().cloned().collect();

        // Send asynchronously, then collect synchronously: every module
        // has to answer anyway.
        for name in &names {
            if let Some(conn) = state.module_mgr.connection_mut(name) {
                conn.send(&request);
            }
        }
        for name in &names {
            let mut response = ModuleResponse::default();
            let resolved = match state.module_mgr.connection_mut(name) {
                Some(conn) => {
                    let mut r = false;
                    while !r && conn.waiting_reply() {
                        r = conn.receive(&mut response, KEEP_ALIVE_INTERVAL);
                        if !r {
                            cmd_info.callback(&CommandStatus::new(CmdErrorCode::Accepted));
                        }
                    }
                    r
                }
                None => false,
            };
            if !resolved {
                status.apply_err_code(CmdErrorCode::Failed);
                status.module_status.push(ModuleCmdStatus::new(
                    name,
                    ModuleResponseType::Error,
                    "no reset response",
                ));
                continue;
            }
            if response.ec != ModuleResponseType::Ok {
                status.apply_err_code(if response.ec == ModuleResponseType::SystemError {
                    CmdErrorCode::SystemError
                } else {
                    CmdErrorCode::Failed
                });
                status.module_status.push(ModuleCmdStatus::new(name, response.ec, response.err));
            }
        }
    }

    // ─── Step ───────────────────────────────────────────────────────

    /// One virtual-time step. Returns the advance to the next instant.
    fn step(&self, state: &mut PlayState, status: &mut CommandStatus, cmd_info: &CommandInfo) -> u64 {
        status.apply_err_code(CmdErrorCode::Succeed);

        // Update the topic board with external inputs.
        for (topic, payload) in &cmd_info.input_msgs {
            state.messages.insert(topic.clone(), payload.clone());
            status.step_message.messages.push((topic.clone(), payload.len()));
        }

        let mut events = Vec::new();
        let advance = match state.stepper.as_mut() {
            Some(stepper) => stepper.get_module_event(&mut events),
            None => return 0,
        };

        for event in &events {
            if !state.modules.contains_key(&event.module_name) {
                continue;
            }
            match event.event_type {
                ModuleEventType::ExecutionTriggered => {
                    if status.code() > CmdErrorCode::Succeed {
                        // A module already failed: keep collecting what
                        // is under way, dispatch nothing new.
                        break;
                    }
                    self.dispatch_step_request(state, status, cmd_info, &event.module_name);
                }
                ModuleEventType::ExecutionFinished => {
                    self.collect_step_reply(state, status, cmd_info, &event.module_name);
                }
            }
        }

        status.step_message.timestamp_ms = state.sim_time;
        if state.scenario_started {
            state.sim_time += advance;
        }
        self.sim_time.store(state.sim_time, Ordering::Release);

        let auto_stop = state.current_config.as_ref().is_some_and(|c| c.auto_stop);
        if status.code() > CmdErrorCode::Succeed && auto_stop {
            cmd_info.callback(&CommandStatus::new(CmdErrorCode::Accepted));
            self.stop_scenario(state, status, cmd_info);
        }
        advance
    }

    fn dispatch_step_request(
        &self,
        state: &mut PlayState,
        status: &mut CommandStatus,
        cmd_info: &CommandInfo,
        name: &str,
    ) {
        // A same-instant Finished may still be pending when the next
        // Triggered arrives (synchronous modules); drain it first.
        if state.modules[name].has_outstanding_step_request {
            self.collect_step_reply(state, status, cmd_info, name);
            if status.code() > CmdErrorCode::Succeed {
                return;
            }
        }

        let mut request = StepRequest {
            sim_time_ms: state.sim_time,
            cur_time_s: std::time::UNIX_EPOCH.elapsed().map(|d| d.as_secs_f64()).unwrap_or(0.0),
            ..Default::default()
        };

        let (sub_topics, pub_topics) = {
            let ctx = &state.modules[name];
            (ctx.sub_topics.clone(), ctx.pub_topics.clone())
        };
        for meta in &sub_topics {
            match meta.kind {
                TopicKind::Inline => {
                    if let Some(payload) = state.messages.get(&meta.name) {
                        request.messages.insert(meta.name.clone(), payload.clone());
                    }
                }
                TopicKind::Shmem { .. } => {
                    let segment = state
                        .shmem_pool
                        .as_mut()
                        .map(|p| p.get_sub_shmem_name(&meta.name, name))
                        .unwrap_or_default();
                    request.sub_topic_shmem_names.insert(meta.name.clone(), segment);
                }
            }
        }
        for meta in &pub_topics {
            if let TopicKind::Shmem { .. } = meta.kind {
                match state.shmem_pool.as_mut().map(|p| p.get_pub_shmem_name(&meta.name)) {
                    Some(Ok(segment)) => {
                        request.pub_topic_shmem_names.insert(meta.name.clone(), segment);
                    }
                    Some(Err(e)) => {
                        error!(module = name, topic = %meta.name, "pub segment allocation failed: {e}");
                        status.apply_err_code(CmdErrorCode::SystemError);
                        return;
                    }
                    None => {}
                }
            }
        }

        let sent = state
            .module_mgr
            .connection_mut(name)
            .map(|c| c.send(&ModuleRequest::Step(request)))
            .unwrap_or(false);
        let Some(ctx) = state.modules.get_mut(name) else { return };
        ctx.has_outstanding_step_request = sent;
        if !sent {
            status.apply_err_code(CmdErrorCode::Failed);
            status.module_status.push(ModuleCmdStatus::new(
                name,
                ModuleResponseType::Error,
                "step request could not be sent",
            ));
        }
    }

    fn collect_step_reply(
        &self,
        state: &mut PlayState,
        status: &mut CommandStatus,
        cmd_info: &CommandInfo,
        name: &str,
    ) {
        if !state.modules[name].has_outstanding_step_request {
            return;
        }
        let forcing = Duration::from_millis(
            state.current_config.as_ref().map_or(5_000, |c| c.max_forcing_timeout_ms as u64),
        );
        let started = Instant::now();
        let mut response = ModuleResponse::default();
        loop {
            let resolved = state
                .module_mgr
                .connection_mut(name)
                .map(|c| c.receive(&mut response, KEEP_ALIVE_INTERVAL.min(forcing)))
                .unwrap_or(false);
            if resolved {
                break;
            }
            // Module silent: is its process even alive?
            if let Err(desc) = state.module_mgr.check_module_status(name) {
                response = ModuleResponse {
                    ec: ModuleResponseType::Error,
                    err: format!("process lost: {desc}"),
                    ..Default::default()
                };
                break;
            }
            if started.elapsed() >= forcing {
                warn!(module = name, "step reply exceeded the forcing timeout");
                response = ModuleResponse::timed_out();
                break;
            }
            cmd_info.callback(&CommandStatus::new(CmdErrorCode::Accepted));
        }

        let Some(ctx) = state.modules.get_mut(name) else { return };
        ctx.has_outstanding_step_request = false;
        ctx.last_step_timed_out = response.ec == ModuleResponseType::Timeout;
        ctx.perf.step_count += 1;
        ctx.perf.elapsed_ms += response.elapsed_ms;
        ctx.perf.max_elapsed_ms = ctx.perf.max_elapsed_ms.max(response.elapsed_ms);

        self.unload_step_result(state, status, name, response);
    }

    fn unload_step_result(
        &self,
        state: &mut PlayState,
        status: &mut CommandStatus,
        name: &str,
        response: ModuleResponse,
    ) {
        let in_shadow_mode = state.modules[name].config.shadow_id != 0;
        match response.ec {
            ModuleResponseType::Ok => {}
            ModuleResponseType::RequireStop => {
                info!(module = name, "module requires the scenario to stop: {}", response.err);
                if !in_shadow_mode {
                    status.apply_err_code(CmdErrorCode::ScenarioStopped);
                }
                status
                    .module_status
                    .push(ModuleCmdStatus::new(name, response.ec, response.err.clone()));
            }
            ModuleResponseType::SystemError => {
                status.apply_err_code(CmdErrorCode::SystemError);
                status
                    .module_status
                    .push(ModuleCmdStatus::new(name, response.ec, response.err.clone()));
            }
            _ => {
                status.apply_err_code(CmdErrorCode::Failed);
                status
                    .module_status
                    .push(ModuleCmdStatus::new(name, response.ec, response.err.clone()));
            }
        }

        // Release shmem holds taken at dispatch.
        let (sub_topics, pub_topics) = {
            let ctx = &state.modules[name];
            (ctx.sub_topics.clone(), ctx.pub_topics.clone())
        };
        for meta in &sub_topics {
            if let TopicKind::Shmem { .. } = meta.kind {
                if let Some(pool) = state.shmem_pool.as_mut() {
                    pool.done_with_sub_shmem(&meta.name, name);
                }
            }
        }
        if response.ec != ModuleResponseType::Ok {
            return;
        }

        // Unload published payloads onto the board; promote written
        // segments to latest.
        let mut published: HashMap<String, Vec<u8>> = response.messages.into_iter().collect();
        for meta in &pub_topics {
            match meta.kind {
                TopicKind::Inline => {
                    if let Some(payload) = published.remove(&meta.name) {
                        status.step_message.messages.push((meta.name.clone(), payload.len()));
                        state.messages.insert(meta.name.clone(), payload);
                    }
                }
                TopicKind::Shmem { size } => {
                    if let Some(pool) = state.shmem_pool.as_mut() {
                        if let Err(e) = pool.done_with_pub_shmem(&meta.name) {
                            debug!(topic = %meta.name, "pub shmem promotion failed: {e}");
                        }
                    }
                    status.step_message.messages.push((meta.name.clone(), size));
                }
            }
        }

        // The first successful answer of the trigger module releases
        // the gate and starts the scenario clock.
        let is_trigger = state
            .current_config
            .as_ref()
            .and_then(|c| c.trigger_module.as_deref())
            .is_some_and(|t| t == name);
        if !state.scenario_started && is_trigger {
            info!(module = name, "scenario started by trigger module");
            state.scenario_started = true;
            if let Some(stepper) = state.stepper.as_mut() {
                stepper.trigger_all_modules();
            }
        }
    }

    // ─── Stop / UnSetup ─────────────────────────────────────────────

    fn stop_scenario(
        &self,
        state: &mut PlayState,
        status: &mut CommandStatus,
        cmd_info: &CommandInfo,
    ) {
        if state.modules.is_empty() {
            if status.code() == CmdErrorCode::Accepted {
                status.apply_err_code(CmdErrorCode::Succeed);
            }
            return;
        }
        self.current_scenario.lock().clear();

        // Collect any in-flight step replies first.
        let names: Vec<String> = state.modules.keys().cloned().collect();
        for name in &names {
            if state.modules[name.as_str()].has_outstanding_step_request {
                self.collect_step_reply(state, status, cmd_info, name);
            }
        }

        if status.code() == CmdErrorCode::Accepted {
            // Explicit stop request: a stopped scenario is the outcome.
            status.apply_err_code(CmdErrorCode::ScenarioStopped);
        }

        // Timed-out modules are skipped: their channel may still carry
        // the stale step reply.
        let stop_set: Vec<String> = names
            .iter()
            .filter(|n| !state.modules[n.as_str()].last_step_timed_out)
            .cloned()
            .collect();
        let mut stopped: Vec<String> = Vec::new();
        for name in &stop_set {
            let sent = state
                .module_mgr
                .connection_mut(name)
                .map(|c| c.send(&ModuleRequest::Stop))
                .unwrap_or(false);
            if sent {
                stopped.push(name.clone());
            }
        }
        let forcing = Duration::from_millis(
            state.current_config.as_ref().map_or(5_000, |c| c.max_forcing_timeout_ms as u64),
        );
        for name in &stopped {
            let mut response = ModuleResponse::default();
            let deadline = Instant::now() + forcing;
            let resolved = match state.module_mgr.connection_mut(name) {
                Some(conn) => {
                    let mut r = false;
                    while !r && conn.waiting_reply() && Instant::now() < deadline {
                        r = conn.receive(&mut response, KEEP_ALIVE_INTERVAL.min(forcing));
                        if !r {
                            cmd_info.callback(&CommandStatus::new(CmdErrorCode::Accepted));
                        }
                    }
                    r
                }
                None => false,
            };
            if resolved && !response.feedback.is_empty() {
                debug!(module = %name, "module stop feedback: {:?}", response.feedback);
            }
        }
        for name in &names {
            if let Some(ctx) = state.modules.get(name.as_str()) {
                status.module_perf.push(ctx.perf.clone());
            }
        }
        state.scenario_set = false;
        info!(sim_time = state.sim_time, "scenario stopped");
    }

    fn un_setup_scenario(&self, state: &mut PlayState) {
        state.sim_time = 0;
        self.sim_time.store(0, Ordering::Release);
        state.stepper = None;
        state.messages.clear();
        state.modules.clear();
        // Dropping the pool removes all shared memory from the OS.
        state.shmem_pool = None;
        state.scenario_set = false;
        state.scenario_started = true;
        self.current_scenario.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use simco_common::config::{ConfigError, ConnectionConfig, CoordinationMode, ModuleCategory};
    use simco_common::status::ModuleInitStatus;
    use std::collections::VecDeque;

    // ── Mock infrastructure ──

    struct FixedLoader(CoordinatorConfig);
    impl ConfigLoader for FixedLoader {
        fn load(&self) -> Result<CoordinatorConfig, ConfigError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct MockConnState {
        requests: Vec<ModuleRequest>,
        script: VecDeque<ModuleResponse>,
        outstanding: bool,
    }

    /// Connection answering each request from a script; an empty script
    /// entry list makes it silent (request never resolves).
    #[derive(Clone)]
    struct MockConnection(Arc<PlMutex<MockConnState>>);

    impl crate::connection::ModuleConnection for MockConnection {
        fn send(&mut self, request: &ModuleRequest) -> bool {
            let mut s = self.0.lock();
            s.requests.push(request.clone());
            s.outstanding = true;
            true
        }
        fn receive(&mut self, response: &mut ModuleResponse, _waiting_time: Duration) -> bool {
            let mut s = self.0.lock();
            if !s.outstanding {
                return false;
            }
            match s.script.pop_front() {
                Some(scripted) => {
                    *response = scripted;
                    s.outstanding = false;
                    true
                }
                None => false, // silent module
            }
        }
        fn waiting_reply(&self) -> bool {
            self.0.lock().outstanding
        }
    }

    struct MockManager {
        topic_info: HashMap<String, TopicPubSubInfo>,
        connections: HashMap<String, MockConnection>,
        boxed: HashMap<String, Box<dyn crate::connection::ModuleConnection>>,
    }

    impl MockManager {
        fn new() -> Self {
            Self {
                topic_info: HashMap::new(),
                connections: HashMap::new(),
                boxed: HashMap::new(),
            }
        }

        fn add_module(&mut self, name: &str, topic_info: TopicPubSubInfo) -> MockConnection {
            let conn = MockConnection(Arc::new(PlMutex::new(MockConnState::default())));
            self.topic_info.insert(name.to_string(), topic_info);
            self.connections.insert(name.to_string(), conn.clone());
            self.boxed.insert(name.to_string(), Box::new(conn.clone()));
            conn
        }
    }

    impl ModuleManager for MockManager {
        fn update_configs(&mut self, _configs: &CoordinatorConfig) {}
        fn monitor_init_workflow(
            &mut self,
            events: &mut Vec<ModuleInitStatus>,
            _cmd_status: &mut Vec<ModuleCmdStatus>,
        ) -> usize {
            for (name, info) in &self.topic_info {
                let mut ev = ModuleInitStatus::new(name.clone(), ModuleInitState::Succeed);
                ev.topic_info = info.clone();
                events.push(ev);
            }
            self.topic_info.len()
        }
        fn connection_mut(&mut self, name: &str) -> Option<&mut (dyn crate::connection::ModuleConnection + 'static)> {
            self.boxed.get_mut(name).map(|b| b.as_mut() as &mut dyn crate::connection::ModuleConnection)
        }
        fn check_module_status(&self, _name: &str) -> Result<(), String> {
            Ok(())
        }
    }

    fn module_config(name: &str, period: u32) -> ModuleConfig {
        ModuleConfig {
            name: name.to_string(),
            bin_path: "/usr/bin/true".into(),
            bin_args: vec![],
            init_args: Default::default(),
            exec_period_ms: period,
            response_time_ms: 0,
            conn_args: ConnectionConfig { cmd_timeout_ms: 1_000, step_timeout_ms: 1_000 },
            auto_launch: false,
            category: ModuleCategory::default(),
            shadow_id: 0,
            priority: 0,
            group: String::new(),
        }
    }

    fn coordinator_config(modules: Vec<ModuleConfig>) -> CoordinatorConfig {
        CoordinatorConfig {
            coord_mode: CoordinationMode::Sync,
            module_configs: modules,
            trigger_module: None,
            auto_stop: true,
            max_forcing_timeout_ms: 200,
            module_log_directory: None,
            override_module_log: false,
        }
    }

    fn ok_response() -> ModuleResponse {
        ModuleResponse::default()
    }

    fn script(conn: &MockConnection, responses: Vec<ModuleResponse>) {
        conn.0.lock().script.extend(responses);
    }

    fn setup_coordinator(
        config: CoordinatorConfig,
        manager: MockManager,
    ) -> (Coordinator, CmdErrorCode) {
        let coordinator = Coordinator::new(Box::new(FixedLoader(config)), Box::new(manager));
        let ec = coordinator.execute(CommandInfo::new(Command::Setup), false);
        (coordinator, ec)
    }

    #[test]
    fn step_without_setup_is_rejected() {
        let coordinator = Coordinator::new(
            Box::new(FixedLoader(coordinator_config(vec![]))),
            Box::new(MockManager::new()),
        );
        assert_eq!(coordinator.execute(CommandInfo::new(Command::Step), false), CmdErrorCode::Rejected);
    }

    #[test]
    fn setup_with_no_ready_module_fails() {
        let config = coordinator_config(vec![]);
        let (_c, ec) = setup_coordinator(config, MockManager::new());
        assert_eq!(ec, CmdErrorCode::Failed);
    }

    #[test]
    fn setup_then_step_dispatches_by_schedule() {
        let mut manager = MockManager::new();
        let conn_a = manager.add_module("planning", TopicPubSubInfo::default());
        // Reset + 2 steps.
        script(&conn_a, vec![ok_response(), ok_response(), ok_response()]);
        let config = coordinator_config(vec![module_config("planning", 10)]);
        let (coordinator, ec) = setup_coordinator(config, manager);
        assert_eq!(ec, CmdErrorCode::Succeed);

        assert_eq!(coordinator.execute(CommandInfo::new(Command::Step), false), CmdErrorCode::Succeed);
        assert_eq!(coordinator.current_simulation_time(), 10);
        assert_eq!(coordinator.execute(CommandInfo::new(Command::Step), false), CmdErrorCode::Succeed);
        assert_eq!(coordinator.current_simulation_time(), 20);

        let requests = conn_a.0.lock().requests.clone();
        // Reset first, then one step per tick with advancing sim time.
        assert!(matches!(requests[0], ModuleRequest::Reset(_)));
        let times: Vec<u64> = requests[1..]
            .iter()
            .map(|r| match r {
                ModuleRequest::Step(s) => s.sim_time_ms,
                other => panic!("unexpected request {other:?}"),
            })
            .collect();
        assert_eq!(times, vec![0, 10]);
    }

    #[test]
    fn published_topic_is_visible_to_subscriber_in_same_tick() {
        let mut manager = MockManager::new();
        let producer_info = TopicPubSubInfo {
            pub_topics: vec!["trajectory".to_string()],
            ..Default::default()
        };
        let consumer_info = TopicPubSubInfo {
            sub_topics: vec!["trajectory".to_string()],
            ..Default::default()
        };
        // Sync mode fires modules in insertion order: "a_producer"
        // sorts first in the play-context map, so its step resolves
        // before the consumer's request is loaded.
        let producer = manager.add_module("a_producer", producer_info);
        let consumer = manager.add_module("b_consumer", consumer_info);

        let published = ModuleResponse {
            messages: vec![("trajectory".to_string(), b"plan-0".to_vec())],
            ..Default::default()
        };
        script(&producer, vec![ok_response(), published]);
        script(&consumer, vec![ok_response(), ok_response()]);

        let config = coordinator_config(vec![
            module_config("a_producer", 10),
            module_config("b_consumer", 10),
        ]);
        let (coordinator, ec) = setup_coordinator(config, manager);
        assert_eq!(ec, CmdErrorCode::Succeed);
        assert_eq!(coordinator.execute(CommandInfo::new(Command::Step), false), CmdErrorCode::Succeed);

        let requests = consumer.0.lock().requests.clone();
        let step = requests
            .iter()
            .find_map(|r| match r {
                ModuleRequest::Step(s) => Some(s.clone()),
                _ => None,
            })
            .expect("consumer must have been stepped");
        assert_eq!(step.messages.get("trajectory").map(Vec::as_slice), Some(b"plan-0".as_slice()));
    }

    #[test]
    fn module_error_fails_the_step_and_stops() {
        let mut manager = MockManager::new();
        let conn = manager.add_module("planning", TopicPubSubInfo::default());
        let error = ModuleResponse {
            ec: ModuleResponseType::Error,
            err: "solver diverged".to_string(),
            ..Default::default()
        };
        script(&conn, vec![ok_response(), error]);
        let config = coordinator_config(vec![module_config("planning", 10)]);
        let (coordinator, _) = setup_coordinator(config, manager);

        let ec = coordinator.execute(CommandInfo::new(Command::Step), false);
        assert_eq!(ec, CmdErrorCode::Failed);
        // auto_stop tears the scenario down; further steps are rejected.
        assert_eq!(coordinator.execute(CommandInfo::new(Command::Step), false), CmdErrorCode::Rejected);
    }

    #[test]
    fn require_stop_ends_the_scenario() {
        let mut manager = MockManager::new();
        let conn = manager.add_module("grading", TopicPubSubInfo::default());
        let stop = ModuleResponse {
            ec: ModuleResponseType::RequireStop,
            err: "scenario goal reached".to_string(),
            ..Default::default()
        };
        script(&conn, vec![ok_response(), stop]);
        let config = coordinator_config(vec![module_config("grading", 10)]);
        let (coordinator, _) = setup_coordinator(config, manager);

        let ec = coordinator.execute(CommandInfo::new(Command::Step), false);
        assert_eq!(ec, CmdErrorCode::ScenarioStopped);
    }

    #[test]
    fn shadow_module_require_stop_does_not_end_the_scenario() {
        let mut manager = MockManager::new();
        let shadow = manager.add_module("shadow_planning", TopicPubSubInfo::default());
        let primary = manager.add_module("zz_primary", TopicPubSubInfo::default());
        let stop = ModuleResponse { ec: ModuleResponseType::RequireStop, ..Default::default() };
        script(&shadow, vec![ok_response(), stop]);
        script(&primary, vec![ok_response(), ok_response()]);

        let mut shadow_cfg = module_config("shadow_planning", 10);
        shadow_cfg.shadow_id = 1;
        let config = coordinator_config(vec![shadow_cfg, module_config("zz_primary", 10)]);
        let (coordinator, _) = setup_coordinator(config, manager);

        // The shadow's RequireStop is recorded but does not stop play.
        let ec = coordinator.execute(CommandInfo::new(Command::Step), false);
        assert_eq!(ec, CmdErrorCode::Succeed);
    }

    #[test]
    fn silent_module_hits_the_forcing_timeout() {
        let mut manager = MockManager::new();
        let conn = manager.add_module("planning", TopicPubSubInfo::default());
        // Only the reset reply; every step request stays unanswered.
        script(&conn, vec![ok_response()]);
        let config = coordinator_config(vec![module_config("planning", 10)]);
        let (coordinator, _) = setup_coordinator(config, manager);

        let started = Instant::now();
        let ec = coordinator.execute(CommandInfo::new(Command::Step), false);
        assert_eq!(ec, CmdErrorCode::Failed);
        // Bounded by max_forcing_timeout_ms (200ms) + margin, far below
        // a hang.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unsetup_clears_scenario_state() {
        let mut manager = MockManager::new();
        let conn = manager.add_module("planning", TopicPubSubInfo::default());
        script(&conn, vec![ok_response(), ok_response(), ok_response()]);
        let config = coordinator_config(vec![module_config("planning", 10)]);
        let (coordinator, _) = setup_coordinator(config, manager);
        coordinator.execute(CommandInfo::new(Command::Step), false);
        assert!(coordinator.current_simulation_time() > 0);

        coordinator.execute(CommandInfo::new(Command::UnSetup), false);
        assert_eq!(coordinator.current_simulation_time(), 0);
        assert_eq!(coordinator.current_scenario(), "");
        assert_eq!(coordinator.execute(CommandInfo::new(Command::Step), false), CmdErrorCode::Rejected);
    }

    #[test]
    fn scenario_path_is_published_while_set() {
        let mut manager = MockManager::new();
        let conn = manager.add_module("planning", TopicPubSubInfo::default());
        script(&conn, vec![ok_response()]);
        let config = coordinator_config(vec![module_config("planning", 10)]);
        let coordinator = Coordinator::new(Box::new(FixedLoader(config)), Box::new(manager));

        let mut setup = CommandInfo::new(Command::Setup);
        setup.reset_params.scenario_path = "/scenarios/cut_in.sim".to_string();
        assert_eq!(coordinator.execute(setup, false), CmdErrorCode::Succeed);
        assert_eq!(coordinator.current_scenario(), "/scenarios/cut_in.sim");
    }
}
