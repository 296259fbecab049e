//! With the worker ceiling reached, the next connection blocks the accept
//! loop until a worker exits and is then dropped without a new worker.
//!
//! Runs without the libtest harness: the blocked wait only ends when
//! SIGCHLD reaches the main thread, so no other thread may take it.

use mserver_core::{
    idle_hook, request_stop, Connection, Endpoint, ListenerConfig, SocketType, Supervisor,
};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn connect(path: &Path) -> UnixStream {
    for _ in 0..500 {
        if let Ok(stream) = UnixStream::connect(path) {
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server never came up on {}", path.display());
}

fn main() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("busy.sock");

    let mut sup = Supervisor::new(Some("busy"));
    sup.set_foreground(true);
    sup.set_signals(&[]);
    sup.set_max_children(1).unwrap();
    sup.set_idle_interval(Duration::from_millis(20));
    sup.set_handler(|mut conn: Connection, _: &ListenerConfig| {
        let _ = conn.write_all(b"+OK\n");
        thread::sleep(Duration::from_millis(500));
        0
    });
    sup.add_listener(Endpoint::Unix(path.clone()), SocketType::Stream);

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).unwrap();

        let first = connect(&client_path);
        let mut greeting = String::new();
        BufReader::new(first.try_clone().unwrap())
            .read_line(&mut greeting)
            .unwrap();
        assert_eq!(greeting, "+OK\n");

        // Arrives while the only worker is still busy
        let mut second = UnixStream::connect(&client_path).unwrap();
        second
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        let mut reply = Vec::new();
        second.read_to_end(&mut reply).unwrap();
        request_stop();
        reply
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

    let reply = client.join().unwrap();
    assert!(reply.is_empty(), "throttled connection was served: {:?}", reply);
    assert_eq!(sup.worker_count(), 0);
    println!("test backpressure ... ok");
}
