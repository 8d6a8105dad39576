// End-to-end coverage of the notify-based monitor against a real forked
// child carrying a real user-notify filter. The tests play the executor:
// they fork the child, collect the listener descriptor it passes back,
// and emulate the status-pipe reaper.

use common::{
    comms_pair, common_test_setup, fake_sandboxee_handshake, notif_filter_for, spawn_unotify_child,
    ChildAction, UnotifyChild,
};
use cordon_policy::Policy;
use cordon_supervisor::seccomp::{bpf_stmt, BPF_K, BPF_RET, SECCOMP_RET_ALLOW};
use cordon_supervisor::{
    FinalStatus, Ipc, Limits, Monitor, MonitorKind, MonitorOptions, Notify, NullNotify, Process,
    Syscall, ViolationKind,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn launch_for_child(
    child: &mut UnotifyChild,
    policy: Policy,
    limits: Limits,
    notify: Box<dyn Notify>,
) -> (Monitor, thread::JoinHandle<()>) {
    let (supervisor_end, mut sandboxee_end) = comms_pair();
    let handshake = thread::spawn(move || {
        fake_sandboxee_handshake(&mut sandboxee_end);
        // Keep the endpoint alive until the handshake thread ends.
        drop(sandboxee_end);
    });
    let process = Process {
        main_pid: child.pid,
        init_pid: 0,
        status_fd: Some(child.status_fd.try_clone().unwrap()),
        notify_fd: Some(child.notify_fd.try_clone().unwrap()),
        awaiting_execve: false,
        comms: supervisor_end,
    };
    let monitor = Monitor::launch(MonitorOptions {
        kind: MonitorKind::Unotify,
        process,
        policy: Arc::new(policy),
        notify,
        ipc: Ipc::new(),
        limits,
        allowed_hosts: None,
    });
    (monitor, handshake)
}

#[test]
fn clean_exit_reports_ok_through_the_status_pipe() {
    common_test_setup();
    let filter = notif_filter_for(libc::SYS_ptrace);
    let mut child = spawn_unotify_child(&filter, ChildAction::ExitZero);
    let policy = Policy::new(bpf_allow_all()).unwrap();
    let (mut monitor, handshake) = launch_for_child(&mut child, policy, Limits::default(), Box::new(NullNotify));

    let verdict = monitor
        .await_result_with_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::Ok);
    assert_eq!(verdict.reason_code(), 0);
    assert!(verdict.sandboxee_usage().is_some());
    handshake.join().unwrap();
    child.join_reaper();
}

struct RecordingNotify {
    violations: Arc<AtomicU64>,
}

impl Notify for RecordingNotify {
    fn on_syscall_violation(&mut self, syscall: &Syscall, kind: ViolationKind) {
        assert_eq!(kind, ViolationKind::Syscall);
        assert_eq!(syscall.nr(), libc::SYS_ptrace as u64);
        self.violations.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn blocked_syscall_reports_a_violation() {
    common_test_setup();
    let filter = notif_filter_for(libc::SYS_ptrace);
    let mut child = spawn_unotify_child(&filter, ChildAction::TriggerBlockedSyscall);
    // The policy knows nothing about ptrace: notifying it is a violation.
    // Stack collection is off: the in-process reaper thread would race the
    // unwinder's ptrace attach over the same wait queue.
    let policy = Policy::new(bpf_allow_all())
        .unwrap()
        .with_stacktrace_collection(false);
    let violations = Arc::new(AtomicU64::new(0));
    let notify = Box::new(RecordingNotify {
        violations: Arc::clone(&violations),
    });
    let (mut monitor, handshake) = launch_for_child(&mut child, policy, Limits::default(), notify);

    let verdict = monitor
        .await_result_with_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::Violation);
    assert_eq!(verdict.reason_code(), libc::SYS_ptrace as i64);
    let syscall = verdict.syscall().expect("violating syscall recorded");
    assert_eq!(syscall.nr(), libc::SYS_ptrace as u64);
    assert_eq!(violations.load(Ordering::Relaxed), 1);
    handshake.join().unwrap();
    child.join_reaper();
}

#[test]
fn allow_on_notify_lets_the_syscall_continue() {
    common_test_setup();
    let filter = notif_filter_for(libc::SYS_getppid);
    let mut child = spawn_unotify_child(&filter, ChildAction::TriggerAllowedSyscall);
    let policy = Policy::new(bpf_allow_all())
        .unwrap()
        .with_allow_on_notify(&[libc::SYS_getppid as u64]);
    let (mut monitor, handshake) =
        launch_for_child(&mut child, policy, Limits::default(), Box::new(NullNotify));

    // The child only exits 0 if the kernel really executed getppid().
    let verdict = monitor
        .await_result_with_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::Ok);
    assert_eq!(verdict.reason_code(), 0);
    handshake.join().unwrap();
    child.join_reaper();
}

#[test]
fn notify_errno_answers_without_executing() {
    common_test_setup();
    let filter = notif_filter_for(libc::SYS_ptrace);
    let mut child = spawn_unotify_child(&filter, ChildAction::TriggerBlockedSyscall);
    // ptrace is answered with EPERM instead of being treated as a
    // violation; the child observes the error and exits with its marker
    // code 13 ("the syscall came back").
    let policy = Policy::new(bpf_allow_all())
        .unwrap()
        .with_notify_errno(libc::SYS_ptrace as u64, libc::EPERM);
    let (mut monitor, handshake) =
        launch_for_child(&mut child, policy, Limits::default(), Box::new(NullNotify));

    let verdict = monitor
        .await_result_with_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::Ok);
    assert_eq!(verdict.reason_code(), 13);
    handshake.join().unwrap();
    child.join_reaper();
}

#[test]
fn wall_time_limit_kills_and_reports_timeout() {
    common_test_setup();
    let filter = notif_filter_for(libc::SYS_ptrace);
    let mut child = spawn_unotify_child(&filter, ChildAction::SleepForever);
    let policy = Policy::new(bpf_allow_all()).unwrap().with_stacktrace_collection(false);
    let limits = Limits {
        wall_time: Some(Duration::from_secs(1)),
        ..Limits::default()
    };
    let start = Instant::now();
    let (mut monitor, handshake) = launch_for_child(&mut child, policy, limits, Box::new(NullNotify));

    let verdict = monitor
        .await_result_with_timeout(Duration::from_secs(10))
        .unwrap();
    let elapsed = start.elapsed();
    assert_eq!(verdict.final_status(), FinalStatus::Timeout);
    assert!(elapsed >= Duration::from_millis(900), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);
    handshake.join().unwrap();
    child.join_reaper();
}

#[test]
fn external_kill_reports_external_kill() {
    common_test_setup();
    let filter = notif_filter_for(libc::SYS_ptrace);
    let mut child = spawn_unotify_child(&filter, ChildAction::SleepForever);
    let policy = Policy::new(bpf_allow_all()).unwrap().with_stacktrace_collection(false);
    let (mut monitor, handshake) =
        launch_for_child(&mut child, policy, Limits::default(), Box::new(NullNotify));

    thread::sleep(Duration::from_millis(100));
    monitor.kill();
    let verdict = monitor
        .await_result_with_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(verdict.final_status(), FinalStatus::ExternalKill);
    handshake.join().unwrap();
    child.join_reaper();
}

fn bpf_allow_all() -> Vec<libc::sock_filter> {
    vec![bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW)]
}
