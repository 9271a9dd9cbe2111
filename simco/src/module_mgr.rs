//! Module process launch, reuse and failure monitoring.
//!
//! The manager owns one [`ModuleStatus`] per configured module and
//! drives each through the init workflow:
//!
//! ```text
//! Start -> Connecting -> Connected -> RequestSent -> Succeed | Failed
//! ```
//!
//! Launch decisions weigh process reuse against relaunch: an existing
//! process is kept only when its launch recipe is unchanged, its binary
//! was not modified on disk since the recorded launch, its last init
//! did not fail, and the process is still known to the registry.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{error, info, warn};
use uuid::Uuid;

use simco_common::config::{CoordinatorConfig, ModuleConfig};
use simco_common::consts::{DEFAULT_HEARTBEAT_INTERVAL_MS, ENV_MODULE_UUID, ENV_REGISTRY_ADDR};
use simco_common::status::{
    ModuleCmdStatus, ModuleInitState, ModuleInitStatus, ModuleResponseType,
};
use simco_common::wire::{ModuleRequest, ModuleResponse};

use crate::connection::{ConnectionFactory, ModuleConnection};
use crate::process::ModuleProcessService;
use crate::registry::{ModuleRegisterSetup, ModuleRegistry};

/// Manager contract consumed by the coordinator; implemented by
/// [`ModuleManagerImpl`] in production and by mocks in tests.
pub trait ModuleManager: Send {
    /// Reconcile the managed module set against a new configuration:
    /// decide reuse vs relaunch per module, terminate dropped modules,
    /// and declare the active slots to the registry.
    fn update_configs(&mut self, configs: &CoordinatorConfig);

    /// Drive the init workflow of every module one transition forward.
    /// Appends newly fired init events and per-module errors; returns
    /// how many modules sit in a terminal state.
    fn monitor_init_workflow(
        &mut self,
        events: &mut Vec<ModuleInitStatus>,
        cmd_status: &mut Vec<ModuleCmdStatus>,
    ) -> usize;

    /// The connection of a module, once its init workflow connected it.
    fn connection_mut(&mut self, name: &str) -> Option<&mut (dyn ModuleConnection + 'static)>;

    /// Post-registration liveness check. `Err` carries the exit or
    /// expiry description the moment the process is judged lost.
    fn check_module_status(&self, name: &str) -> Result<(), String>;
}

/// Manager-side state of one module.
struct ModuleStatus {
    config: ModuleConfig,
    /// Per-launch instance uuid; empty for manually launched modules.
    uuid: String,
    /// Registered step-channel address.
    addr: String,
    conn: Option<Box<dyn ModuleConnection>>,
    init_status: ModuleInitStatus,
    last_launch_mtime: Option<SystemTime>,
    last_check_mtime: Option<SystemTime>,
    event_fired: bool,
}

impl ModuleStatus {
    fn new(config: ModuleConfig, uuid: String) -> Self {
        let init_status = ModuleInitStatus::new(config.name.clone(), ModuleInitState::Start);
        Self {
            config,
            uuid,
            addr: String::new(),
            conn: None,
            init_status,
            last_launch_mtime: None,
            last_check_mtime: None,
            event_fired: false,
        }
    }
}

/// Production module manager.
pub struct ModuleManagerImpl {
    registry: Arc<ModuleRegistry>,
    conn_factory: Box<dyn ConnectionFactory>,
    proc_service: Box<dyn ModuleProcessService>,
    module_log_directory: PathBuf,
    override_module_log: bool,
    module_status: BTreeMap<String, ModuleStatus>,
}

impl ModuleManagerImpl {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        conn_factory: Box<dyn ConnectionFactory>,
        proc_service: Box<dyn ModuleProcessService>,
        module_log_directory: Option<PathBuf>,
        override_module_log: bool,
    ) -> crate::CoordinatorResult<Self> {
        let module_log_directory = module_log_directory.unwrap_or_else(|| PathBuf::from("."));
        if !module_log_directory.is_dir() {
            std::fs::create_dir_all(&module_log_directory).map_err(|e| {
                crate::CoordinatorError::InvalidArgument(format!(
                    "the module log directory cannot be created: {e}"
                ))
            })?;
        }
        info!(dir = %module_log_directory.display(), "module manager using log directory");
        Ok(Self {
            registry,
            conn_factory,
            proc_service,
            module_log_directory,
            override_module_log,
            module_status: BTreeMap::new(),
        })
    }

    fn add_module_config(&mut self, new_config: &ModuleConfig) -> String {
        let uuid = if new_config.auto_launch { Uuid::new_v4().to_string() } else { String::new() };
        self.module_status.insert(
            new_config.name.clone(),
            ModuleStatus::new(new_config.clone(), uuid.clone()),
        );
        uuid
    }

    fn heartbeat_interval_for(config: &ModuleConfig) -> u32 {
        // Auto-launched children are watched through the reaper, not
        // through heartbeats.
        if config.auto_launch { 0 } else { DEFAULT_HEARTBEAT_INTERVAL_MS }
    }

    /// A module setup is reusable when (logical AND):
    /// 1. init args and auto-launch flag are unchanged;
    /// 2. for auto-launch, the launch recipe is unchanged;
    /// 3. the previous init did not fail;
    /// 4. step timeouts stay both zero or both nonzero (a zero timeout
    ///    means no liveness signal, so switching is a relaunch);
    /// 5. the child process is still known and its binary unmodified.
    fn check_module_reusable(&mut self, name: &str, new_config: &ModuleConfig) -> bool {
        let old = &self.module_status[name];
        let old_config = &old.config;

        if old_config.init_args != new_config.init_args
            || old_config.auto_launch != new_config.auto_launch
        {
            return false;
        }
        if new_config.auto_launch
            && (old_config.bin_path != new_config.bin_path
                || old_config.bin_args != new_config.bin_args)
        {
            return false;
        }
        if old.init_status.state == ModuleInitState::Failed {
            return false;
        }
        let (old_t, new_t) =
            (old_config.conn_args.step_timeout_ms, new_config.conn_args.step_timeout_ms);
        if old_t != new_t && (old_t == 0 || new_t == 0) {
            return false;
        }
        if new_config.auto_launch && self.registry.get_child_process_handle(name).is_none() {
            return false;
        }
        if new_config.auto_launch && self.check_module_binary_updated(new_config) {
            return false;
        }

        // Reusable: clear the last init status.
        let reset_conn = {
            let old = self.module_status.get_mut(name).unwrap();
            old.init_status.state = ModuleInitState::Start;
            old.init_status.topic_info.clear();
            old.event_fired = false;
            old.config.conn_args != new_config.conn_args
        };
        if reset_conn {
            self.module_status.get_mut(name).unwrap().conn = None;
        }
        true
    }

    /// Compare the binary's modification time on disk against the one
    /// recorded at launch, remembering the checked value.
    pub fn check_module_binary_updated(&mut self, config: &ModuleConfig) -> bool {
        let mtime = std::fs::metadata(&config.bin_path).and_then(|m| m.modified()).ok();
        let status = self.module_status.get_mut(&config.name).expect("module status must exist");
        status.last_check_mtime = mtime;
        if mtime != status.last_launch_mtime {
            info!(
                module = %config.name,
                path = %config.bin_path.display(),
                "module binary updated on disk"
            );
            return true;
        }
        false
    }

    fn terminate(&mut self, name: &str) {
        let Some(pid) = self.registry.get_child_process_handle(name) else {
            warn!(module = name, "module process no longer exists");
            return;
        };
        info!(module = name, pid = pid.as_raw(), "terminating module");
        if let Err(e) = self.proc_service.terminate_module(pid) {
            error!(module = name, "previously launched module could not terminate: {e}");
        }
    }

    fn terminate_inactive_modules(&mut self, active: &std::collections::HashSet<String>) {
        let inactive: Vec<String> =
            self.module_status.keys().filter(|n| !active.contains(*n)).cloned().collect();
        for name in inactive {
            if self.module_status[&name].config.auto_launch {
                self.terminate(&name);
            }
            self.registry.remove_registered_module(&name);
            self.module_status.remove(&name);
        }
    }

    fn module_log_file_path(&self, name: &str) -> PathBuf {
        let file_name = if self.override_module_log {
            format!("{name}.log")
        } else {
            let stamp = std::time::UNIX_EPOCH.elapsed().map(|d| d.as_secs()).unwrap_or(0);
            format!("{name}.{stamp}.log")
        };
        self.module_log_directory.join(file_name)
    }

    /// Move the previous log of `name` aside so a relaunch starts a
    /// fresh file.
    fn archive_module_log_file(&self, name: &str) {
        if !self.override_module_log {
            return; // timestamped logs never collide
        }
        let current = self.module_log_file_path(name);
        if !current.exists() {
            return;
        }
        let archived = self.module_log_directory.join(format!("{name}.prev.log"));
        match std::fs::rename(&current, &archived) {
            Ok(()) => info!(module = name, to = %archived.display(), "archived module log"),
            Err(e) => error!(module = name, "failed to archive module log: {e}"),
        }
    }

    fn launch_module(&mut self, name: &str, cmd_status: &mut Vec<ModuleCmdStatus>) -> ModuleInitState {
        let config = self.module_status[name].config.clone();
        let uuid = self.module_status[name].uuid.clone();

        if !config.bin_path.is_file() {
            let err = format!(
                "the specified path of the executable does not exist: {}",
                config.bin_path.display()
            );
            error!(module = name, "process launching failed: {err}");
            cmd_status.push(ModuleCmdStatus::new(name, ModuleResponseType::Error, err));
            return ModuleInitState::Failed;
        }

        self.archive_module_log_file(name);
        let log_path = self.module_log_file_path(name);
        let envs = vec![
            (ENV_REGISTRY_ADDR.to_string(), self.registry.local_registry_addr()),
            (ENV_MODULE_UUID.to_string(), uuid),
        ];
        let pid = match self.proc_service.create_module(
            &config.bin_path,
            &config.bin_args,
            &envs,
            &log_path,
        ) {
            Ok(pid) => pid,
            Err(e) => {
                error!(module = name, "launching module process failed: {e}");
                cmd_status.push(ModuleCmdStatus::new(
                    name,
                    ModuleResponseType::Error,
                    format!("process launching failed: {e}"),
                ));
                return ModuleInitState::Failed;
            }
        };
        info!(module = name, pid = pid.as_raw(), log = %log_path.display(), "module process launched");
        self.registry.add_child_process_handle(name, pid);

        let status = self.module_status.get_mut(name).unwrap();
        status.init_status.log_file =
            log_path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
        status.last_launch_mtime =
            std::fs::metadata(&config.bin_path).and_then(|m| m.modified()).ok();
        ModuleInitState::Connecting
    }

    fn try_connecting_module(
        &mut self,
        name: &str,
        cmd_status: &mut Vec<ModuleCmdStatus>,
    ) -> ModuleInitState {
        let status = self.module_status.get_mut(name).unwrap();
        if let Some(conn) = &status.conn {
            if !conn.waiting_reply() {
                return ModuleInitState::Connected;
            }
        }
        match self.conn_factory.create_connection(&status.addr, &status.config.conn_args) {
            Ok(conn) => {
                status.conn = Some(conn);
                ModuleInitState::Connected
            }
            Err(e) => {
                error!(module = name, addr = %status.addr, "connection creation error: {e}");
                cmd_status.push(ModuleCmdStatus::new(
                    name,
                    ModuleResponseType::Error,
                    format!("connection creation error, endpoint: {}", status.addr),
                ));
                ModuleInitState::Failed
            }
        }
    }

    fn record_exit_failure(
        status: &mut ModuleStatus,
        exit_desc: Option<String>,
        cmd_status: &mut Vec<ModuleCmdStatus>,
    ) {
        let Some(desc) = exit_desc else { return };
        status.init_status.state = ModuleInitState::Failed;
        error!(module = %status.config.name, "module process exited after launching: {desc}");
        cmd_status.push(ModuleCmdStatus::new(
            &status.config.name,
            ModuleResponseType::Error,
            format!("process exited: {desc}"),
        ));
    }
}

impl ModuleManager for ModuleManagerImpl {
    fn update_configs(&mut self, configs: &CoordinatorConfig) {
        let mut active = std::collections::HashSet::new();
        let mut registry_setup = Vec::new();

        for new_config in &configs.module_configs {
            let name = new_config.name.clone();
            active.insert(name.clone());

            if !self.module_status.contains_key(&name) {
                let uuid = self.add_module_config(new_config);
                info!(module = %name, %uuid, "added new module status");
                registry_setup.push(ModuleRegisterSetup {
                    name,
                    uuid,
                    heartbeat_interval_ms: Self::heartbeat_interval_for(new_config),
                });
                continue;
            }

            if self.check_module_reusable(&name, new_config) {
                let status = self.module_status.get_mut(&name).unwrap();
                status.config = new_config.clone();
                info!(module = %name, uuid = %status.uuid, "reused module status");
                continue;
            }

            // Not reusable: terminate and set up anew, keeping the
            // recorded binary times so an unchanged binary is not
            // mistaken for an update.
            if self.module_status[&name].config.auto_launch {
                self.terminate(&name);
            }
            self.registry.remove_registered_module(&name);
            let (t_launch, t_check) = {
                let old = &self.module_status[&name];
                (old.last_launch_mtime, old.last_check_mtime)
            };
            self.module_status.remove(&name);
            let uuid = self.add_module_config(new_config);
            let status = self.module_status.get_mut(&name).unwrap();
            status.last_launch_mtime = t_launch;
            status.last_check_mtime = t_check;
            info!(module = %name, %uuid, "module status updated");
            registry_setup.push(ModuleRegisterSetup {
                name,
                uuid,
                heartbeat_interval_ms: Self::heartbeat_interval_for(new_config),
            });
        }

        self.terminate_inactive_modules(&active);
        self.registry.setup_active_module_context(registry_setup);
    }

    fn monitor_init_workflow(
        &mut self,
        events: &mut Vec<ModuleInitStatus>,
        cmd_status: &mut Vec<ModuleCmdStatus>,
    ) -> usize {
        let names: Vec<String> = self.module_status.keys().cloned().collect();
        let mut finished_count = 0;

        for name in names {
            let state = self.module_status[&name].init_status.state;
            match state {
                ModuleInitState::Start => {
                    let auto_launch = self.module_status[&name].config.auto_launch;
                    if auto_launch && self.registry.get_child_process_handle(&name).is_none() {
                        let (t_launch, t_check) = {
                            let st = &self.module_status[&name];
                            (st.last_launch_mtime, st.last_check_mtime)
                        };
                        if t_launch.is_some() && t_check.is_some() && t_launch != t_check {
                            let mut ev =
                                ModuleInitStatus::new(name.clone(), ModuleInitState::Start);
                            ev.binary_updated = true;
                            events.push(ev);
                        }
                        let next = self.launch_module(&name, cmd_status);
                        self.module_status.get_mut(&name).unwrap().init_status.state = next;
                    } else {
                        self.module_status.get_mut(&name).unwrap().init_status.state =
                            ModuleInitState::Connecting;
                    }
                }
                ModuleInitState::Connecting => {
                    let reg = self.registry.get_module_register_status(&name);
                    if reg.registered {
                        info!(module = %name, addr = %reg.addr, "got registered module address");
                        {
                            let status = self.module_status.get_mut(&name).unwrap();
                            if reg.addr != status.addr {
                                status.conn = None;
                            }
                            status.addr = reg.addr;
                        }
                        let next = self.try_connecting_module(&name, cmd_status);
                        self.module_status.get_mut(&name).unwrap().init_status.state = next;
                    } else {
                        let status = self.module_status.get_mut(&name).unwrap();
                        Self::record_exit_failure(status, reg.exit_desc, cmd_status);
                    }
                }
                ModuleInitState::Connected => {
                    let status = self.module_status.get_mut(&name).unwrap();
                    events.push(status.init_status.clone());
                    let request = ModuleRequest::Init {
                        init_args: status
                            .config
                            .init_args
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                        group: status.config.group.clone(),
                    };
                    let sent = status.conn.as_mut().is_some_and(|c| c.send(&request));
                    status.init_status.state = if sent {
                        ModuleInitState::RequestSent
                    } else {
                        ModuleInitState::Failed
                    };
                }
                ModuleInitState::RequestSent => {
                    let status = self.module_status.get_mut(&name).unwrap();
                    let mut response = ModuleResponse::default();
                    let resolved = status
                        .conn
                        .as_mut()
                        .is_some_and(|c| c.receive(&mut response, Duration::ZERO));
                    if resolved {
                        status.init_status.state = if response.ec == ModuleResponseType::Ok {
                            ModuleInitState::Succeed
                        } else {
                            cmd_status.push(ModuleCmdStatus::new(
                                &name,
                                response.ec,
                                response.err.clone(),
                            ));
                            error!(module = %name, "module init failed: {}", response.err);
                            ModuleInitState::Failed
                        };
                        status.init_status.topic_info.sub_topics = response.sub_topics;
                        status.init_status.topic_info.pub_topics = response.pub_topics;
                        status.init_status.topic_info.sub_shmems = response.sub_shmems;
                        status.init_status.topic_info.pub_shmems = response.pub_shmems;
                    } else {
                        // No resolution yet: refresh the registered
                        // address and watch for a process exit.
                        let reg = self.registry.get_module_register_status(&name);
                        let status = self.module_status.get_mut(&name).unwrap();
                        if reg.registered && reg.addr != status.addr {
                            status.init_status.state = ModuleInitState::Connecting;
                        }
                        Self::record_exit_failure(status, reg.exit_desc, cmd_status);
                    }
                }
                ModuleInitState::Succeed | ModuleInitState::Failed => {}
            }

            let status = self.module_status.get_mut(&name).unwrap();
            if status.init_status.state.is_terminal() {
                if !status.event_fired {
                    events.push(status.init_status.clone());
                    status.event_fired = true;
                }
                finished_count += 1;
            }
        }
        finished_count
    }

    fn connection_mut(&mut self, name: &str) -> Option<&mut (dyn ModuleConnection + 'static)> {
        self.module_status.get_mut(name).and_then(|s| s.conn.as_deref_mut())
    }

    fn check_module_status(&self, name: &str) -> Result<(), String> {
        // A contended registry map counts as alive; this runs on the
        // step hot path.
        let Some(status) = self.registry.try_module_register_status(name) else {
            return Ok(());
        };
        if status.registered {
            return Ok(());
        }
        let desc = status.exit_desc.unwrap_or_else(|| "expired".to_string());
        warn!(module = name, "module process lost: {desc}");
        Err(desc)
    }
}
