// End-to-end coverage of the trace-based monitor. The tests play both
// external roles themselves: the executor (spawning a plain child and
// handing it over) and the sandboxee's comms side (answering the bring-up
// handshake from a thread). Serialized with a lock: the monitor drains
// wait events process-wide.

use common::{common_test_setup, comms_pair, fake_sandboxee_handshake, sockaddr_v4_bytes};
use cordon_comms::Comms;
use cordon_policy::Policy;
use cordon_supervisor::seccomp::{bpf_stmt, BPF_K, BPF_RET, SECCOMP_RET_ALLOW};
use cordon_supervisor::{
    AllowedHosts, FinalStatus, Ipc, Limits, Monitor, MonitorKind, MonitorOptions, NullNotify,
    Process, SupervisorError,
};
use std::net::Ipv4Addr;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

static MONITOR_LOCK: Mutex<()> = Mutex::new(());

fn allow_all_policy() -> Arc<Policy> {
    Arc::new(Policy::new(vec![bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW)]).unwrap())
}

// A child that stays alive until its stdin closes, handed over the way an
// executor would after the initial execve.
fn spawn_cat() -> Child {
    Command::new("cat")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawning cat")
}

struct LaunchedMonitor {
    monitor: Monitor,
    sandboxee_comms: thread::JoinHandle<Comms>,
}

fn launch(child: &Child, ipc: Ipc, limits: Limits, hosts: Option<Arc<AllowedHosts>>) -> LaunchedMonitor {
    let (supervisor_end, mut sandboxee_end) = comms_pair();
    let sandboxee_comms = thread::spawn(move || {
        fake_sandboxee_handshake(&mut sandboxee_end);
        sandboxee_end
    });
    let process = Process {
        main_pid: child.id() as libc::pid_t,
        init_pid: 0,
        status_fd: None,
        notify_fd: None,
        awaiting_execve: false,
        comms: supervisor_end,
    };
    let monitor = Monitor::launch(MonitorOptions {
        kind: MonitorKind::Ptrace,
        process,
        policy: allow_all_policy(),
        notify: Box::new(NullNotify),
        ipc,
        limits,
        allowed_hosts: hosts,
    });
    LaunchedMonitor {
        monitor,
        sandboxee_comms,
    }
}

#[test]
fn minimal_success_yields_ok_with_exit_code_zero() {
    common_test_setup();
    let _guard = MONITOR_LOCK.lock().unwrap();
    let mut child = spawn_cat();
    let mut launched = launch(&child, Ipc::new(), Limits::default(), None);
    assert!(!launched.monitor.is_done());

    // EOF on stdin makes cat exit cleanly.
    drop(child.stdin.take());
    let verdict = launched
        .monitor
        .await_result_with_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::Ok);
    assert_eq!(verdict.reason_code(), 0);
    assert!(verdict.monitor_usage().is_some());
    launched.sandboxee_comms.join().unwrap();
}

#[test]
fn killed_child_yields_signaled_with_the_signal_number() {
    common_test_setup();
    let _guard = MONITOR_LOCK.lock().unwrap();
    let child = spawn_cat();
    let mut launched = launch(&child, Ipc::new(), Limits::default(), None);

    unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    let verdict = launched
        .monitor
        .await_result_with_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::Signaled);
    assert_eq!(verdict.reason_code(), libc::SIGTERM as i64);
    launched.sandboxee_comms.join().unwrap();
}

#[test]
fn wall_time_limit_yields_timeout_around_the_deadline() {
    common_test_setup();
    let _guard = MONITOR_LOCK.lock().unwrap();
    let mut child = spawn_cat();
    let limits = Limits {
        wall_time: Some(Duration::from_secs(1)),
        ..Limits::default()
    };
    let start = Instant::now();
    let mut launched = launch(&child, Ipc::new(), limits, None);
    let verdict = launched
        .monitor
        .await_result_with_timeout(Duration::from_secs(10))
        .unwrap();
    let elapsed = start.elapsed();
    assert_eq!(verdict.final_status(), FinalStatus::Timeout);
    assert!(elapsed >= Duration::from_millis(900), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);
    drop(child.stdin.take());
    launched.sandboxee_comms.join().unwrap();
}

#[test]
fn external_kill_yields_external_kill_within_bounded_latency() {
    common_test_setup();
    let _guard = MONITOR_LOCK.lock().unwrap();
    let mut child = spawn_cat();
    let mut launched = launch(&child, Ipc::new(), Limits::default(), None);

    thread::sleep(Duration::from_millis(100));
    let start = Instant::now();
    launched.monitor.kill();
    let verdict = launched
        .monitor
        .await_result_with_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::ExternalKill);
    assert!(start.elapsed() < Duration::from_secs(5));
    drop(child.stdin.take());
    launched.sandboxee_comms.join().unwrap();
}

#[test]
fn await_result_times_out_without_touching_the_verdict() {
    common_test_setup();
    let _guard = MONITOR_LOCK.lock().unwrap();
    let mut child = spawn_cat();
    let mut launched = launch(&child, Ipc::new(), Limits::default(), None);

    assert!(matches!(
        launched
            .monitor
            .await_result_with_timeout(Duration::from_millis(100)),
        Err(SupervisorError::DeadlineExceeded)
    ));
    assert!(!launched.monitor.is_done());

    drop(child.stdin.take());
    let verdict = launched
        .monitor
        .await_result_with_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::Ok);
    launched.sandboxee_comms.join().unwrap();
}

#[test]
fn handshake_failure_yields_setup_error() {
    common_test_setup();
    let _guard = MONITOR_LOCK.lock().unwrap();
    let mut child = spawn_cat();
    let (supervisor_end, sandboxee_end) = comms_pair();
    // The "sandboxee" disappears immediately: bring-up must fail at the
    // ready handshake.
    drop(sandboxee_end);
    let process = Process {
        main_pid: child.id() as libc::pid_t,
        init_pid: 0,
        status_fd: None,
        notify_fd: None,
        awaiting_execve: false,
        comms: supervisor_end,
    };
    let mut monitor = Monitor::launch(MonitorOptions {
        kind: MonitorKind::Ptrace,
        process,
        policy: allow_all_policy(),
        notify: Box::new(NullNotify),
        ipc: Ipc::new(),
        limits: Limits::default(),
        allowed_hosts: None,
    });
    assert!(monitor.is_done());
    let verdict = monitor
        .await_result_with_timeout(Duration::from_secs(1))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::SetupError);
    // The monitor never attached; the child is still ours to clean up.
    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn denied_proxy_connect_yields_a_network_violation() {
    common_test_setup();
    let _guard = MONITOR_LOCK.lock().unwrap();
    let mut child = spawn_cat();
    let mut ipc = Ipc::new();
    ipc.enable_network_proxy().unwrap();
    // Empty allowlist: every connect is a violation.
    let hosts = Arc::new(AllowedHosts::new(vec![]));

    let (supervisor_end, mut sandboxee_end) = comms_pair();
    let sandboxee = thread::spawn(move || {
        let (_policy, mut endpoints) = fake_sandboxee_handshake(&mut sandboxee_end);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].0, cordon_supervisor::NETWORK_PROXY_CHANNEL_NAME);
        let (_, proxy_fd) = endpoints.remove(0);
        let mut proxy_comms = Comms::from_handle(proxy_fd);
        proxy_comms
            .send_bytes(&sockaddr_v4_bytes(Ipv4Addr::new(10, 0, 0, 1), 80))
            .unwrap();
        // No response frame is expected; the proxy shuts down instead.
        (sandboxee_end, proxy_comms)
    });

    let process = Process {
        main_pid: child.id() as libc::pid_t,
        init_pid: 0,
        status_fd: None,
        notify_fd: None,
        awaiting_execve: false,
        comms: supervisor_end,
    };
    let mut monitor = Monitor::launch(MonitorOptions {
        kind: MonitorKind::Ptrace,
        process,
        policy: allow_all_policy(),
        notify: Box::new(NullNotify),
        ipc,
        limits: Limits::default(),
        allowed_hosts: Some(hosts),
    });

    let verdict = monitor
        .await_result_with_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::Violation);
    assert_eq!(
        verdict.reason_code(),
        cordon_supervisor::reason::VIOLATION_NETWORK
    );
    assert!(verdict
        .network_violation_msg()
        .unwrap()
        .contains("10.0.0.1"));
    drop(child.stdin.take());
    sandboxee.join().unwrap();
}
