//! End-to-end init workflow tests against real processes and sockets.

use std::collections::BTreeMap;
use std::net::{TcpListener, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use simco::connection::TcpConnectionFactory;
use simco::module_mgr::{ModuleManager, ModuleManagerImpl};
use simco::process::OsModuleProcessService;
use simco::registry::ModuleRegistry;
use simco_common::config::{
    ConnectionConfig, CoordinationMode, CoordinatorConfig, ModuleCategory, ModuleConfig,
};
use simco_common::status::{ModuleInitState, ModuleInitStatus};
use simco_common::wire::{
    ModuleRequest, ModuleResponse, RegistryReply, RegistryRequest, read_message, write_message,
};

fn module_config(name: &str, bin_path: &str, auto_launch: bool) -> ModuleConfig {
    ModuleConfig {
        name: name.to_string(),
        bin_path: PathBuf::from(bin_path),
        bin_args: vec![],
        init_args: BTreeMap::new(),
        exec_period_ms: 20,
        response_time_ms: 0,
        conn_args: ConnectionConfig { cmd_timeout_ms: 2_000, step_timeout_ms: 1_000 },
        auto_launch,
        category: ModuleCategory::default(),
        shadow_id: 0,
        priority: 0,
        group: String::new(),
    }
}

fn coordinator_config(modules: Vec<ModuleConfig>, log_dir: &std::path::Path) -> CoordinatorConfig {
    CoordinatorConfig {
        coord_mode: CoordinationMode::Async,
        module_configs: modules,
        trigger_module: None,
        auto_stop: true,
        max_forcing_timeout_ms: 2_000,
        module_log_directory: Some(log_dir.to_path_buf()),
        override_module_log: false,
    }
}

fn build_manager(log_dir: &std::path::Path) -> (ModuleManagerImpl, Arc<ModuleRegistry>) {
    let registry = Arc::new(ModuleRegistry::new().unwrap());
    let manager = ModuleManagerImpl::new(
        Arc::clone(&registry),
        Box::new(TcpConnectionFactory),
        Box::new(OsModuleProcessService),
        Some(log_dir.to_path_buf()),
        false,
    )
    .unwrap();
    (manager, registry)
}

/// Drive the init workflow until `expected` modules reached a terminal
/// state or the deadline passes.
fn drive_init(
    manager: &mut ModuleManagerImpl,
    expected: usize,
    deadline: Duration,
) -> (Vec<ModuleInitStatus>, Vec<simco_common::status::ModuleCmdStatus>) {
    let mut events = Vec::new();
    let mut cmd_status = Vec::new();
    let end = Instant::now() + deadline;
    loop {
        let finished = manager.monitor_init_workflow(&mut events, &mut cmd_status);
        if finished >= expected {
            return (events, cmd_status);
        }
        assert!(
            Instant::now() < end,
            "init workflow did not finish in time; events so far: {events:?}"
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn immediately_exiting_module_fails_with_exit_description() {
    let log_dir = tempfile::tempdir().unwrap();
    let (mut manager, _registry) = build_manager(log_dir.path());

    // /bin/false exits with code 1 before ever registering.
    let config = coordinator_config(
        vec![module_config("broken", "/bin/false", true)],
        log_dir.path(),
    );
    manager.update_configs(&config);

    let started = Instant::now();
    let (events, cmd_status) = drive_init(&mut manager, 1, Duration::from_secs(10));

    let terminal = events
        .iter()
        .rev()
        .find(|e| e.name == "broken" && e.state.is_terminal())
        .expect("a terminal init event must fire");
    assert_eq!(terminal.state, ModuleInitState::Failed);

    let failure = cmd_status
        .iter()
        .find(|s| s.name == "broken")
        .expect("a per-module failure must be recorded");
    assert!(
        failure.msg.contains("exited"),
        "failure must carry the exit description, got: {}",
        failure.msg
    );
    // Bounded: detection through the reaper/purge path, no hang.
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn missing_binary_fails_immediately() {
    let log_dir = tempfile::tempdir().unwrap();
    let (mut manager, _registry) = build_manager(log_dir.path());

    let config = coordinator_config(
        vec![module_config("ghost", "/nonexistent/module-binary", true)],
        log_dir.path(),
    );
    manager.update_configs(&config);

    let (events, cmd_status) = drive_init(&mut manager, 1, Duration::from_secs(2));
    assert!(events.iter().any(|e| e.state == ModuleInitState::Failed));
    assert!(cmd_status.iter().any(|s| s.msg.contains("does not exist")));
}

#[test]
fn manually_launched_module_connects_and_initializes() {
    let log_dir = tempfile::tempdir().unwrap();
    let (mut manager, registry) = build_manager(log_dir.path());
    let registry_addr = registry.local_registry_addr();

    let config = coordinator_config(
        vec![module_config("perception", "/usr/bin/true", false)],
        log_dir.path(),
    );
    manager.update_configs(&config);

    // The test plays the module: register over UDP, then answer the
    // Init request on the step channel.
    let module = std::thread::spawn(move || {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let step_addr = listener.local_addr().unwrap().to_string();

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let register = RegistryRequest::Register {
            key: "perception".to_string(),
            uuid: "inst-1".to_string(),
            addr: step_addr,
        };
        udp.send_to(&serde_json::to_vec(&register).unwrap(), &registry_addr).unwrap();
        let mut buf = [0u8; 4096];
        let (len, _) = udp.recv_from(&mut buf).unwrap();
        let reply: RegistryReply = serde_json::from_slice(&buf[..len]).unwrap();
        assert!(matches!(reply, RegistryReply::Accepted { .. }));

        let (mut stream, _) = listener.accept().unwrap();
        let request: ModuleRequest = read_message(&mut stream).unwrap();
        assert!(matches!(request, ModuleRequest::Init { .. }));
        let response = ModuleResponse {
            sub_topics: vec!["camera_raw".to_string()],
            pub_topics: vec!["obstacles".to_string()],
            pub_shmems: vec![("pointcloud".to_string(), 4096)],
            ..Default::default()
        };
        write_message(&mut stream, &response).unwrap();
    });

    let (events, cmd_status) = drive_init(&mut manager, 1, Duration::from_secs(10));
    module.join().unwrap();

    assert!(cmd_status.is_empty(), "no failures expected: {cmd_status:?}");
    let terminal = events
        .iter()
        .rev()
        .find(|e| e.name == "perception" && e.state.is_terminal())
        .expect("a terminal init event must fire");
    assert_eq!(terminal.state, ModuleInitState::Succeed);
    assert_eq!(terminal.topic_info.sub_topics, vec!["camera_raw".to_string()]);
    assert_eq!(terminal.topic_info.pub_topics, vec!["obstacles".to_string()]);
    assert_eq!(terminal.topic_info.pub_shmems, vec![("pointcloud".to_string(), 4096)]);

    // Post-registration liveness: a fresh heartbeat keeps the module
    // alive from the manager's point of view.
    let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    udp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let heartbeat =
        RegistryRequest::Heartbeat { key: "perception".to_string(), uuid: "inst-1".to_string() };
    udp.send_to(&serde_json::to_vec(&heartbeat).unwrap(), registry.local_registry_addr()).unwrap();
    let mut buf = [0u8; 4096];
    let (len, _) = udp.recv_from(&mut buf).unwrap();
    let reply: RegistryReply = serde_json::from_slice(&buf[..len]).unwrap();
    assert!(matches!(reply, RegistryReply::Accepted { .. }));

    assert!(manager.check_module_status("perception").is_ok());
    assert!(manager.connection_mut("perception").is_some());
}
