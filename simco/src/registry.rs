//! Module registration and liveness service.
//!
//! One dedicated service thread listens on a localhost datagram socket
//! for [`RegistryRequest`] messages: Register announces a module's
//! step-channel address under its registration key, Heartbeat refreshes
//! its expiry, Unregister withdraws it. Address discovery stays
//! pull-based: the module manager polls
//! [`ModuleRegistry::get_module_register_status`].
//!
//! Auto-launched modules (heartbeat interval 0) are monitored through
//! the [`ModuleReaper`] instead of heartbeats: when their process
//! exits, the purge pass records the exit description and clears the
//! registration so the owner observes "not registered" on its next
//! poll. Heartbeat-based registrations past their expiry are purged
//! entirely.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use simco_common::consts::{
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS, REGISTRY_PURGE_INTERVAL_MS,
};
use simco_common::wire::{RegistryReply, RegistryRequest};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::reaper::ModuleReaper;

/// One module slot declared valid for the upcoming run.
#[derive(Debug, Clone)]
pub struct ModuleRegisterSetup {
    pub name: String,
    /// Expected instance uuid; empty for manually launched modules.
    pub uuid: String,
    /// 0 marks an auto-launched module monitored through the reaper.
    pub heartbeat_interval_ms: u32,
}

/// Read contract of [`ModuleRegistry::get_module_register_status`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterStatus {
    pub registered: bool,
    pub addr: String,
    /// Exit description of a module whose process disappeared,
    /// consumed on first read.
    pub exit_desc: Option<String>,
}

/// Registry-side state of one module slot.
#[derive(Debug, Clone, Default)]
struct RegisterContext {
    uuid: String,
    /// Empty until registered.
    addr: String,
    heartbeat_interval_ms: u32,
    /// `None` means never expires.
    expired_at: Option<Instant>,
    disconnecting: bool,
    disconnected: bool,
    child_pid: Option<Pid>,
}

#[derive(Default)]
struct RegistryState {
    modules: HashMap<String, RegisterContext>,
    module_exit_desc: HashMap<String, String>,
    last_purge: Option<Instant>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    disconnect_cv: Condvar,
    running: AtomicBool,
    reaper: ModuleReaper,
}

impl RegistryInner {
    /// Scan all contexts for expired heartbeats and exited children.
    /// Rate-limited; `forced` makes the reaper run a collection pass.
    /// Callers must hold the state lock.
    fn purge_registry(&self, state: &mut RegistryState, forced: bool) {
        let now = Instant::now();
        if let Some(last) = state.last_purge {
            if now.duration_since(last) < Duration::from_millis(REGISTRY_PURGE_INTERVAL_MS) {
                return;
            }
        }
        state.last_purge = Some(now);

        let mut expired = Vec::new();
        for (name, ctx) in state.modules.iter_mut() {
            if ctx.heartbeat_interval_ms == 0 {
                // Auto-launched module: liveness comes from the reaper.
                let Some(pid) = ctx.child_pid else { continue };
                if let Some(desc) = self.reaper.get_module_exit_status(pid, forced) {
                    info!(module = %name, pid = pid.as_raw(), "module process exited: {desc}");
                    state.module_exit_desc.insert(name.clone(), desc);
                    // The slot is kept so the next relaunch with the
                    // same uuid can register again.
                    ctx.addr.clear();
                    ctx.child_pid = None;
                }
            } else if ctx.expired_at.is_some_and(|t| now > t) {
                warn!(module = %name, "expired module purged");
                expired.push(name.clone());
            }
        }
        for name in expired {
            state.modules.remove(&name);
        }
    }

    fn refresh_expiry(ctx: &mut RegisterContext) {
        ctx.expired_at = (ctx.heartbeat_interval_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(ctx.heartbeat_interval_ms as u64));
    }

    fn register_module(&self, key: &str, uuid: &str, addr: &str) -> RegistryReply {
        enum Decision {
            Accept,
            Reject(&'static str),
            Disconnect,
        }

        info!(module = key, uuid, "registering module");
        let mut state = self.state.lock();
        self.purge_registry(&mut state, false);

        let decision = {
            let ctx = state.modules.entry(key.to_string()).or_default();
            if ctx.addr.is_empty() {
                if ctx.uuid.is_empty() {
                    // Manually launched module announcing itself.
                    ctx.uuid = uuid.to_string();
                    if ctx.heartbeat_interval_ms == 0 {
                        ctx.heartbeat_interval_ms = DEFAULT_HEARTBEAT_INTERVAL_MS;
                    }
                    Decision::Accept
                } else if ctx.uuid != uuid {
                    warn!(module = key, uuid, "unexpected module registering, ignored");
                    Decision::Reject("unexpected instance uuid")
                } else {
                    Decision::Accept
                }
            } else if ctx.heartbeat_interval_ms > 0 {
                if ctx.uuid == uuid {
                    // A re-register of a live instance means something
                    // went wrong on the module side. Disconnect it.
                    error!(module = key, uuid, "module re-registered unexpectedly, disconnected");
                    Decision::Disconnect
                } else {
                    warn!(module = key, uuid, "a same named module is already registered, ignored");
                    Decision::Reject("already registered")
                }
            } else {
                warn!(module = key, uuid, "a same named auto-launched module is registered, ignored");
                Decision::Reject("already registered")
            }
        };

        match decision {
            Decision::Accept => {
                let ctx = state.modules.get_mut(key).unwrap();
                ctx.addr = addr.to_string();
                let interval = ctx.heartbeat_interval_ms;
                Self::refresh_expiry(ctx);
                info!(module = key, uuid, addr, "module registered");
                RegistryReply::Accepted { heartbeat_interval_ms: interval }
            }
            Decision::Disconnect => {
                state.modules.remove(key);
                RegistryReply::Rejected { reason: "already registered".into() }
            }
            Decision::Reject(reason) => RegistryReply::Rejected { reason: reason.into() },
        }
    }

    fn unregister_module(&self, key: &str, uuid: &str) -> RegistryReply {
        info!(module = key, uuid, "un-registering module");
        let mut state = self.state.lock();
        let (interval, disconnecting) = match state.modules.get_mut(key) {
            None => {
                warn!(module = key, "un-register ignored, context not found");
                return RegistryReply::Rejected { reason: "not registered".into() };
            }
            Some(ctx) if ctx.uuid != uuid => {
                warn!(module = key, uuid, "un-register ignored, registered context does not match");
                return RegistryReply::Rejected { reason: "uuid mismatch".into() };
            }
            Some(ctx) => {
                if ctx.disconnecting {
                    // An ejector thread is waiting; let it erase the
                    // context.
                    ctx.disconnected = true;
                }
                (ctx.heartbeat_interval_ms, ctx.disconnecting)
            }
        };
        if disconnecting {
            self.disconnect_cv.notify_all();
        } else {
            state.modules.remove(key);
        }
        info!(module = key, uuid, "module un-registered");
        RegistryReply::Accepted { heartbeat_interval_ms: interval }
    }

    fn refresh_module(&self, key: &str, uuid: &str) -> RegistryReply {
        let mut state = self.state.lock();
        let Some(ctx) = state.modules.get_mut(key) else {
            warn!(module = key, uuid, "unexpected heartbeat, context not found");
            return RegistryReply::Rejected { reason: "not registered".into() };
        };
        if ctx.uuid != uuid {
            warn!(module = key, uuid, "unexpected heartbeat, registered context differs");
            return RegistryReply::Rejected { reason: "uuid mismatch".into() };
        }
        if ctx.disconnecting {
            info!(module = key, uuid, "asking module to disconnect");
            return RegistryReply::Disconnecting;
        }
        Self::refresh_expiry(ctx);
        RegistryReply::Accepted { heartbeat_interval_ms: ctx.heartbeat_interval_ms }
    }

    /// Service loop body: bounded receive, dispatch, reply to source.
    fn serve(&self, socket: UdpSocket) {
        let mut buf = vec![0u8; 64 * 1024];
        while self.running.load(Ordering::Acquire) {
            let (len, src) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    // Idle: run the periodic purge.
                    let mut state = self.state.lock();
                    self.purge_registry(&mut state, false);
                    continue;
                }
                Err(e) => {
                    error!("registry socket recv error: {e}");
                    break;
                }
            };
            let request: RegistryRequest = match serde_json::from_slice(&buf[..len]) {
                Ok(r) => r,
                Err(e) => {
                    error!("registry unloading message error: {e}");
                    continue;
                }
            };
            debug!(?request, %src, "registry request");
            let reply = match &request {
                RegistryRequest::Register { key, uuid, addr } => {
                    self.register_module(key, uuid, addr)
                }
                RegistryRequest::Unregister { key, uuid } => self.unregister_module(key, uuid),
                RegistryRequest::Heartbeat { key, uuid } => self.refresh_module(key, uuid),
            };
            match serde_json::to_vec(&reply) {
                Ok(payload) => {
                    if let Err(e) = socket.send_to(&payload, src) {
                        error!("registry socket send error: {e}");
                    }
                }
                Err(e) => error!("registry reply encode error: {e}"),
            }
        }
        info!("module registry serving finished");
    }
}

/// The registration service. Owns the service thread, the reaper and
/// the asynchronous ejector threads.
pub struct ModuleRegistry {
    inner: Arc<RegistryInner>,
    service_addr: String,
    service_thread: Option<JoinHandle<()>>,
    ejector_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ModuleRegistry {
    /// Bind the registry socket and start serving.
    pub fn new() -> CoordinatorResult<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .map_err(|e| CoordinatorError::Registry(format!("register socket bind failed: {e}")))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(REGISTRY_PURGE_INTERVAL_MS)))
            .map_err(|e| CoordinatorError::Registry(e.to_string()))?;
        let service_addr = socket
            .local_addr()
            .map_err(|e| CoordinatorError::Registry(e.to_string()))?
            .to_string();
        info!(addr = %service_addr, "binding module registry socket");

        let inner = Arc::new(RegistryInner {
            state: Mutex::new(RegistryState::default()),
            disconnect_cv: Condvar::new(),
            running: AtomicBool::new(true),
            reaper: ModuleReaper::new(),
        });
        let worker = Arc::clone(&inner);
        let service_thread = std::thread::Builder::new()
            .name("simco-registry".to_string())
            .spawn(move || worker.serve(socket))
            .map_err(|e| CoordinatorError::Registry(e.to_string()))?;

        Ok(Self {
            inner,
            service_addr,
            service_thread: Some(service_thread),
            ejector_threads: Mutex::new(Vec::new()),
        })
    }

    /// Address modules must send their registry datagrams to.
    pub fn local_registry_addr(&self) -> String {
        self.service_addr.clone()
    }

    /// Declare the set of module slots valid for the upcoming run. Any
    /// prior context is cleared.
    pub fn setup_active_module_context(&self, module_setup: Vec<ModuleRegisterSetup>) {
        for t in self.ejector_threads.lock().drain(..) {
            let _ = t.join();
        }

        let mut state = self.inner.state.lock();
        self.inner.purge_registry(&mut state, false);
        state.module_exit_desc.clear();

        for setup in module_setup {
            let occupied = state.modules.contains_key(&setup.name);
            if occupied && setup.uuid.is_empty() {
                // A manually launched module may have registered before
                // this setup arrived; keep it.
                continue;
            }
            // An auto-launch slot finding a leftover registration
            // replaces it; the stale instance invalidates itself on its
            // next heartbeat.
            state.modules.insert(
                setup.name,
                RegisterContext {
                    uuid: setup.uuid,
                    heartbeat_interval_ms: setup.heartbeat_interval_ms,
                    ..Default::default()
                },
            );
        }
    }

    /// Whether `name` is currently registered and at which address.
    /// Also surfaces (and consumes) a stored exit description for
    /// modules that disappeared.
    pub fn get_module_register_status(&self, name: &str) -> RegisterStatus {
        let mut state = self.inner.state.lock();
        self.inner.purge_registry(&mut state, false);
        let exit_desc = state.module_exit_desc.remove(name);
        match state.modules.get(name) {
            Some(ctx) => RegisterStatus {
                registered: !ctx.addr.is_empty(),
                addr: ctx.addr.clone(),
                exit_desc,
            },
            None => RegisterStatus { registered: false, addr: String::new(), exit_desc },
        }
    }

    /// Contention-free probe variant: returns `None` instead of
    /// blocking when the registry map is busy.
    pub fn try_module_register_status(&self, name: &str) -> Option<RegisterStatus> {
        let mut state = self.inner.state.try_lock()?;
        self.inner.purge_registry(&mut state, false);
        let exit_desc = state.module_exit_desc.remove(name);
        let status = match state.modules.get(name) {
            Some(ctx) => RegisterStatus {
                registered: !ctx.addr.is_empty(),
                addr: ctx.addr.clone(),
                exit_desc,
            },
            None => RegisterStatus { registered: false, addr: String::new(), exit_desc },
        };
        Some(status)
    }

    /// Proactively un-register a module on intentional shutdown.
    ///
    /// Modules without heartbeats are erased immediately; the rest are
    /// told to disconnect through their next heartbeat and awaited by
    /// an asynchronous ejector thread so the caller never blocks on
    /// socket traffic.
    pub fn remove_registered_module(&self, name: &str) {
        let mut state = self.inner.state.lock();
        let Some(ctx) = state.modules.get_mut(name) else { return };
        if ctx.heartbeat_interval_ms == 0 {
            state.modules.remove(name);
            return;
        }
        ctx.disconnecting = true;

        let inner = Arc::clone(&self.inner);
        let module = name.to_string();
        let ejector = std::thread::Builder::new()
            .name("simco-registry-ejector".to_string())
            .spawn(move || {
                let mut state = inner.state.lock();
                let deadline =
                    Instant::now() + Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS);
                info!(module = %module, "waiting module to disconnect");
                loop {
                    let Some(ctx) = state.modules.get(&module) else { return };
                    if ctx.disconnected {
                        break;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    inner.disconnect_cv.wait_for(&mut state, deadline - now);
                }
                if let Some(ctx) = state.modules.remove(&module) {
                    info!(
                        module = %module,
                        uuid = %ctx.uuid,
                        "{}",
                        if ctx.disconnected {
                            "disconnected gracefully"
                        } else {
                            "disconnect not confirmed, removed forcibly"
                        }
                    );
                }
            });
        match ejector {
            Ok(handle) => self.ejector_threads.lock().push(handle),
            Err(e) => error!("spawning registry ejector failed: {e}"),
        }
    }

    /// Record the spawned child of an auto-launched module and arm the
    /// reaper for it.
    pub fn add_child_process_handle(&self, name: &str, pid: Pid) {
        let mut state = self.inner.state.lock();
        if let Some(ctx) = state.modules.get_mut(name) {
            ctx.child_pid = Some(pid);
        }
        self.inner.reaper.add_query_handle(pid);
    }

    /// Child pid of an auto-launched module, if its process is still
    /// recorded. Forces an exit-status collection pass first.
    pub fn get_child_process_handle(&self, name: &str) -> Option<Pid> {
        let mut state = self.inner.state.lock();
        self.inner.purge_registry(&mut state, true);
        state.modules.get(name).and_then(|ctx| ctx.child_pid)
    }
}

impl Drop for ModuleRegistry {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(t) = self.service_thread.take() {
            let _ = t.join();
        }
        for t in self.ejector_threads.lock().drain(..) {
            let _ = t.join();
        }
        info!("module registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestClient {
        socket: UdpSocket,
        registry_addr: String,
    }

    impl TestClient {
        fn new(registry: &ModuleRegistry) -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            Self { socket, registry_addr: registry.local_registry_addr() }
        }

        fn exchange(&self, request: &RegistryRequest) -> RegistryReply {
            let payload = serde_json::to_vec(request).unwrap();
            self.socket.send_to(&payload, &self.registry_addr).unwrap();
            let mut buf = [0u8; 4096];
            let (len, _) = self.socket.recv_from(&mut buf).unwrap();
            serde_json::from_slice(&buf[..len]).unwrap()
        }

        fn register(&self, key: &str, uuid: &str, addr: &str) -> RegistryReply {
            self.exchange(&RegistryRequest::Register {
                key: key.into(),
                uuid: uuid.into(),
                addr: addr.into(),
            })
        }
    }

    fn setup(registry: &ModuleRegistry, name: &str, uuid: &str, interval_ms: u32) {
        registry.setup_active_module_context(vec![ModuleRegisterSetup {
            name: name.into(),
            uuid: uuid.into(),
            heartbeat_interval_ms: interval_ms,
        }]);
    }

    #[test]
    fn register_then_status_reports_address() {
        let registry = ModuleRegistry::new().unwrap();
        setup(&registry, "planning", "u-1", 0);
        let client = TestClient::new(&registry);

        let reply = client.register("planning", "u-1", "127.0.0.1:7001");
        assert!(matches!(reply, RegistryReply::Accepted { heartbeat_interval_ms: 0 }));

        let status = registry.get_module_register_status("planning");
        assert!(status.registered);
        assert_eq!(status.addr, "127.0.0.1:7001");
    }

    #[test]
    fn uuid_mismatch_is_rejected() {
        let registry = ModuleRegistry::new().unwrap();
        setup(&registry, "planning", "expected", 0);
        let client = TestClient::new(&registry);

        let reply = client.register("planning", "intruder", "127.0.0.1:7002");
        assert!(matches!(reply, RegistryReply::Rejected { .. }));
        assert!(!registry.get_module_register_status("planning").registered);
    }

    #[test]
    fn unknown_module_registers_as_remote() {
        let registry = ModuleRegistry::new().unwrap();
        let client = TestClient::new(&registry);
        let reply = client.register("adhoc", "u-9", "127.0.0.1:7003");
        assert!(matches!(
            reply,
            RegistryReply::Accepted { heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS }
        ));
        assert!(registry.get_module_register_status("adhoc").registered);
    }

    #[test]
    fn heartbeat_expiry_purges_the_module() {
        let registry = ModuleRegistry::new().unwrap();
        setup(&registry, "remote", "", 100);
        let client = TestClient::new(&registry);
        client.register("remote", "u-2", "127.0.0.1:7004");
        assert!(registry.get_module_register_status("remote").registered);

        // No heartbeat within the interval: the next purge pass (rate
        // limited to 500ms) drops the registration.
        std::thread::sleep(Duration::from_millis(700));
        assert!(!registry.get_module_register_status("remote").registered);
    }

    #[test]
    fn zero_interval_never_expires() {
        let registry = ModuleRegistry::new().unwrap();
        setup(&registry, "auto", "u-3", 0);
        let client = TestClient::new(&registry);
        client.register("auto", "u-3", "127.0.0.1:7005");

        std::thread::sleep(Duration::from_millis(700));
        assert!(registry.get_module_register_status("auto").registered);
    }

    #[test]
    fn heartbeat_refreshes_expiry() {
        let registry = ModuleRegistry::new().unwrap();
        setup(&registry, "remote", "", 600);
        let client = TestClient::new(&registry);
        client.register("remote", "u-4", "127.0.0.1:7006");

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(300));
            let reply = client.exchange(&RegistryRequest::Heartbeat {
                key: "remote".into(),
                uuid: "u-4".into(),
            });
            assert!(matches!(reply, RegistryReply::Accepted { .. }));
        }
        // 1.2s elapsed, interval 600ms, but refreshed throughout.
        assert!(registry.get_module_register_status("remote").registered);
    }

    #[test]
    fn unregister_removes_the_module() {
        let registry = ModuleRegistry::new().unwrap();
        setup(&registry, "planning", "u-5", 0);
        let client = TestClient::new(&registry);
        client.register("planning", "u-5", "127.0.0.1:7007");

        let reply = client.exchange(&RegistryRequest::Unregister {
            key: "planning".into(),
            uuid: "u-5".into(),
        });
        assert!(matches!(reply, RegistryReply::Accepted { .. }));
        assert!(!registry.get_module_register_status("planning").registered);
    }

    #[test]
    fn remove_registered_module_without_heartbeat_is_immediate() {
        let registry = ModuleRegistry::new().unwrap();
        setup(&registry, "auto", "u-6", 0);
        let client = TestClient::new(&registry);
        client.register("auto", "u-6", "127.0.0.1:7008");

        registry.remove_registered_module("auto");
        assert!(!registry.get_module_register_status("auto").registered);
    }

    #[test]
    fn ejection_asks_module_to_disconnect_via_heartbeat() {
        let registry = ModuleRegistry::new().unwrap();
        setup(&registry, "remote", "", 5_000);
        let client = TestClient::new(&registry);
        client.register("remote", "u-7", "127.0.0.1:7009");

        registry.remove_registered_module("remote");
        let reply = client.exchange(&RegistryRequest::Heartbeat {
            key: "remote".into(),
            uuid: "u-7".into(),
        });
        assert!(matches!(reply, RegistryReply::Disconnecting));

        // The module confirms by un-registering; the ejector erases it.
        client.exchange(&RegistryRequest::Unregister {
            key: "remote".into(),
            uuid: "u-7".into(),
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if !registry.get_module_register_status("remote").registered {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("ejected module still registered");
    }
}
