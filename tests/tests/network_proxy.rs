use common::{common_test_setup, comms_pair, sockaddr_v4_bytes};
use cordon_comms::CommsError;
use cordon_supervisor::{AllowedHosts, NetworkProxyServer, ProxyRule, ProxyStatus};
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn spawn_proxy(
    hosts: AllowedHosts,
) -> (
    cordon_comms::Comms,
    Arc<ProxyStatus>,
    Arc<AtomicBool>,
    thread::JoinHandle<()>,
) {
    let (client, server) = comms_pair();
    let status = Arc::new(ProxyStatus::new());
    let woken = Arc::new(AtomicBool::new(false));
    let thread_status = Arc::clone(&status);
    let thread_woken = Arc::clone(&woken);
    let handle = thread::spawn(move || {
        let mut server = NetworkProxyServer::new(
            server,
            Arc::new(hosts),
            thread_status,
            Box::new(move || {
                thread_woken.store(true, Ordering::Release);
            }),
        );
        server.run();
    });
    (client, status, woken, handle)
}

fn local_port(listener: &TcpListener) -> u16 {
    match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr.port(),
        other => panic!("unexpected listener address {:?}", other),
    }
}

#[test]
fn allowed_connect_returns_a_working_socket() {
    common_test_setup();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = local_port(&listener);
    let accepted = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        sock.read_exact(&mut buf).unwrap();
        buf
    });

    let hosts = AllowedHosts::new(vec![ProxyRule::host(Ipv4Addr::LOCALHOST.into(), port)]);
    let (mut client, status, _woken, proxy) = spawn_proxy(hosts);

    client
        .send_bytes(&sockaddr_v4_bytes(Ipv4Addr::LOCALHOST, port))
        .unwrap();
    assert_eq!(client.recv_i32().unwrap(), 0);
    let sock = client.recv_fd().unwrap();
    let res = unsafe {
        libc::write(
            sock.as_raw(),
            b"hello".as_ptr() as *const libc::c_void,
            5,
        )
    };
    assert_eq!(res, 5);
    drop(sock);
    assert_eq!(&accepted.join().unwrap(), b"hello");
    assert!(!status.violation_occurred());

    // Closing our end shuts the proxy loop down cleanly.
    client.terminate();
    proxy.join().unwrap();
    assert!(!status.violation_occurred());
}

#[test]
fn denied_connect_records_violation_and_stops_the_loop() {
    common_test_setup();
    let hosts = AllowedHosts::new(vec![ProxyRule::host(Ipv4Addr::LOCALHOST.into(), 1234)]);
    let (mut client, status, woken, proxy) = spawn_proxy(hosts);

    client
        .send_bytes(&sockaddr_v4_bytes(Ipv4Addr::new(10, 0, 0, 1), 80))
        .unwrap();
    proxy.join().unwrap();

    assert!(status.violation_occurred());
    assert!(status.violation_msg().contains("10.0.0.1"));
    assert!(status.violation_msg().contains("80"));
    assert!(woken.load(Ordering::Acquire));
    // No FD and no response frame were sent; the channel is simply closed.
    assert_eq!(client.recv_i32(), Err(CommsError::PeerDisconnected));
}

#[test]
fn malformed_sockaddr_is_answered_with_einval() {
    common_test_setup();
    let hosts = AllowedHosts::new(vec![ProxyRule::host(Ipv4Addr::LOCALHOST.into(), 0)]);
    let (mut client, status, _woken, proxy) = spawn_proxy(hosts);

    // Too short to be a sockaddr_in.
    client.send_bytes(&[1, 2, 3]).unwrap();
    assert_eq!(client.recv_i32().unwrap(), libc::EINVAL);

    // The loop keeps serving after a malformed request.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = local_port(&listener);
    let hosts_miss = sockaddr_v4_bytes(Ipv4Addr::LOCALHOST, port);
    // Not in the allowlist port-wise? port 0 rule allows any port, so
    // this one connects.
    let accepted = thread::spawn(move || listener.accept().map(|_| ()));
    client.send_bytes(&hosts_miss).unwrap();
    assert_eq!(client.recv_i32().unwrap(), 0);
    let _sock = client.recv_fd().unwrap();
    accepted.join().unwrap().unwrap();
    assert!(!status.violation_occurred());

    client.terminate();
    proxy.join().unwrap();
}

#[test]
fn connect_failure_reports_the_real_errno() {
    common_test_setup();
    // Reserve a port, then free it so the connect is refused.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = local_port(&listener);
    drop(listener);

    let hosts = AllowedHosts::new(vec![ProxyRule::host(Ipv4Addr::LOCALHOST.into(), port)]);
    let (mut client, status, _woken, proxy) = spawn_proxy(hosts);

    client
        .send_bytes(&sockaddr_v4_bytes(Ipv4Addr::LOCALHOST, port))
        .unwrap();
    assert_eq!(client.recv_i32().unwrap(), libc::ECONNREFUSED);
    assert!(!status.violation_occurred());

    client.terminate();
    proxy.join().unwrap();
}
