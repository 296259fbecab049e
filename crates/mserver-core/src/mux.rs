//! Readiness multiplexer
//!
//! A single-threaded `poll(2)` loop over the open listeners. Between waits
//! it runs the idle hook, which may end the loop; a wait never lasts longer
//! than the idle interval, so deferred signal work is picked up promptly
//! even without socket activity.

use crate::listener::Listener;
use mserver_common::{Error, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::time::Duration;
use tracing::{debug, error};

/// What the loop should do after a connection callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAction {
    /// Keep serving
    Continue,
    /// Shut this listener down and drop it
    Close,
    /// Leave the loop
    Shutdown,
}

/// Callback run when a listener becomes readable
pub type ConnCallback = Box<dyn FnMut(&mut Listener) -> ConnAction>;

struct Registration {
    listener: Listener,
    callback: ConnCallback,
}

/// Event loop over registered listeners
pub struct Multiplexer {
    entries: Vec<Registration>,
    idle_interval: Duration,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Multiplexer {
    /// Create a multiplexer waking at least every `idle_interval`
    pub fn new(idle_interval: Duration) -> Self {
        Self {
            entries: Vec::new(),
            idle_interval,
        }
    }

    /// Longest wait between idle-hook runs
    pub fn idle_interval(&self) -> Duration {
        self.idle_interval
    }

    /// Change the longest wait between idle-hook runs
    pub fn set_idle_interval(&mut self, interval: Duration) {
        self.idle_interval = interval;
    }

    /// Add an open listener and the callback serving it
    pub fn register_listener(&mut self, listener: Listener, callback: ConnCallback) -> Result<()> {
        if !listener.is_open() {
            return Err(Error::Listener(format!(
                "cannot add connection {}: not open",
                listener.address_string()
            )));
        }
        self.entries.push(Registration { listener, callback });
        Ok(())
    }

    /// Number of registered listeners
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Run until the idle hook returns `true`, a callback asks for shutdown,
    /// or no listeners remain. Interrupted waits are not errors.
    pub fn run<F>(&mut self, mut idle: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let millis = self.idle_interval.as_millis().min(u128::from(u16::MAX)) as u16;
        let timeout = PollTimeout::from(millis);

        loop {
            if idle() {
                debug!("idle hook requested stop");
                return Ok(());
            }
            if self.entries.is_empty() {
                debug!("no listeners left");
                return Ok(());
            }

            let ready = match self.wait(timeout) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("poll: {}", e);
                    return Err(Error::Io(e.into()));
                }
            };

            // Indices shift when a listener is removed, so walk backwards
            for index in ready.into_iter().rev() {
                let entry = &mut self.entries[index];
                match (entry.callback)(&mut entry.listener) {
                    ConnAction::Continue => {}
                    ConnAction::Close => {
                        let mut entry = self.entries.remove(index);
                        entry.listener.shutdown();
                    }
                    ConnAction::Shutdown => return Ok(()),
                }
            }
        }
    }

    fn wait(&self, timeout: PollTimeout) -> std::result::Result<Vec<usize>, Errno> {
        let (indices, mut fds): (Vec<usize>, Vec<PollFd<'_>>) = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.listener.as_fd().map(|fd| (index, fd)))
            .map(|(index, fd)| (index, PollFd::new(fd, PollFlags::POLLIN)))
            .unzip();

        let n = poll(&mut fds, timeout)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let wanted = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
        let ready = fds
            .iter()
            .zip(indices)
            .filter(|(fd, _)| fd.revents().map(|ev| ev.intersects(wanted)).unwrap_or(false))
            .map(|(_, index)| index)
            .collect();
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Endpoint;
    use std::cell::Cell;
    use std::io::Write;
    use std::net::TcpStream;
    use std::rc::Rc;
    use std::thread;

    fn open_listener() -> Listener {
        let mut listener = Listener::new(Endpoint::Inet("127.0.0.1:0".parse().unwrap()));
        listener.open().unwrap();
        listener
    }

    #[test]
    fn test_register_requires_open_listener() {
        let mut mux = Multiplexer::default();
        let closed = Listener::new(Endpoint::Inet("127.0.0.1:0".parse().unwrap()));
        assert!(mux
            .register_listener(closed, Box::new(|_: &mut Listener| ConnAction::Continue))
            .is_err());
        assert_eq!(mux.count(), 0);
    }

    #[test]
    fn test_idle_hook_stops_loop() {
        let mut mux = Multiplexer::new(Duration::from_millis(10));
        assert_eq!(mux.idle_interval(), Duration::from_millis(10));
        mux.register_listener(open_listener(), Box::new(|_: &mut Listener| ConnAction::Continue))
            .unwrap();

        let mut calls = 0;
        mux.run(|| {
            calls += 1;
            calls == 3
        })
        .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(mux.count(), 1);
    }

    #[test]
    fn test_readable_listener_runs_callback() {
        let listener = open_listener();
        let addr = listener.local_addr().unwrap();
        let accepted = Rc::new(Cell::new(0));

        let mut mux = Multiplexer::new(Duration::from_millis(50));
        let seen = accepted.clone();
        mux.register_listener(
            listener,
            Box::new(move |listener: &mut Listener| {
                let _conn = listener.accept().unwrap();
                seen.set(seen.get() + 1);
                ConnAction::Close
            }),
        )
        .unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"hello").unwrap();
        });

        // Ends once the only listener has been closed
        mux.run(|| false).unwrap();
        client.join().unwrap();
        assert_eq!(accepted.get(), 1);
        assert_eq!(mux.count(), 0);
    }
}
