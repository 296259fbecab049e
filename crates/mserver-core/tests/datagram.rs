//! Datagram listeners: each datagram is served by its own worker, which
//! replies through the listening socket

use mserver_core::{
    idle_hook, request_stop, Connection, Endpoint, ListenerConfig, SocketType, Supervisor,
};
use std::io::{Read, Write};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn send(client: &UnixDatagram, server: &Path, message: &[u8]) {
    for _ in 0..500 {
        if client.send_to(message, server).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server never came up on {}", server.display());
}

fn receive(client: &UnixDatagram) -> String {
    let mut buf = [0u8; 64];
    let n = client.recv(&mut buf).unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[test]
fn test_datagram_workers_reply_through_listener() {
    let dir = TempDir::new().unwrap();
    let server_path = dir.path().join("dgram.sock");
    let client_path = dir.path().join("client.sock");

    let mut sup = Supervisor::new(Some("dgram"));
    sup.set_foreground(true);
    sup.set_signals(&[]);
    sup.set_idle_interval(Duration::from_millis(20));
    sup.set_handler(|mut conn: Connection, config: &ListenerConfig| {
        assert_eq!(config.socket_type, SocketType::Datagram);
        let mut request = String::new();
        if conn.read_to_string(&mut request).is_err() {
            return 74;
        }
        let reply = format!("pong {}", request);
        match conn.write_all(reply.as_bytes()) {
            Ok(()) => 0,
            Err(_) => 74,
        }
    });
    sup.add_listener(Endpoint::Unix(server_path.clone()), SocketType::Datagram)
        .set_bufsize(16);

    let target = server_path.clone();
    let client = thread::spawn(move || {
        let client = UnixDatagram::bind(&client_path).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        send(&client, &target, b"one");
        let first = receive(&client);
        // The first worker did not close the parent's socket
        send(&client, &target, b"two");
        let second = receive(&client);

        request_stop();
        (first, second)
    });

    sup.start().unwrap();
    sup.run().unwrap();

    for _ in 0..200 {
        if sup.worker_count() == 0 {
            break;
        }
        idle_hook();
        thread::sleep(Duration::from_millis(10));
    }
    sup.stop().unwrap();

    let (first, second) = client.join().unwrap();
    assert_eq!(first, "pong one");
    assert_eq!(second, "pong two");
    assert_eq!(sup.worker_count(), 0);
}
