//! Admission gate
//!
//! Runs once per accepted connection, in this order: access control,
//! single-process mode, the stop latch, the worker ceiling, the pre-spawn
//! hook. Only a connection that passes every check gets a worker process.

use crate::acl::{AccessControl, AclResult};
use crate::connection::Connection;
use crate::exit::EX_SOFTWARE;
use crate::listener::{Listener, DEFAULT_BUFSIZE};
use crate::mux::ConnAction;
use crate::registry::{self, lock, SharedTable};
use crate::signals::{self, SignalRelay};
use mserver_common::types::{PeerAddr, SocketType};
use mserver_common::{Error, Result};
use nix::unistd::{fork, pause, ForkResult, Pid};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Serves one connection and returns the worker's exit status
pub type ConnectionHandler = Rc<dyn Fn(Connection, &ListenerConfig) -> i32>;

/// Runs before a connection is served; returning `false` drops it
pub type PreforkHook = Rc<dyn Fn(&Connection, &ListenerConfig) -> bool>;

/// Per-listener settings
#[derive(Clone)]
pub struct ListenerConfig {
    /// Printable listening address
    pub address: String,
    /// Stream or datagram
    pub socket_type: SocketType,
    /// Receive buffer size of a datagram listener
    pub bufsize: usize,
    /// Serve connections inside the supervisor instead of forking
    pub single_process: bool,
    /// Log the session transcript
    pub transcript: bool,
    /// Idle timeout of accepted connections; zero disables it
    pub timeout: Duration,
    /// Overrides the supervisor ACL
    pub acl: Option<Rc<dyn AccessControl>>,
}

impl ListenerConfig {
    pub(crate) fn new(address: String, socket_type: SocketType, timeout: Duration) -> Self {
        Self {
            address,
            socket_type,
            bufsize: DEFAULT_BUFSIZE,
            single_process: false,
            transcript: false,
            timeout,
            acl: None,
        }
    }

    /// Builder-style ACL override
    pub fn set_acl(&mut self, acl: impl AccessControl + 'static) -> &mut Self {
        self.acl = Some(Rc::new(acl));
        self
    }

    pub fn set_bufsize(&mut self, bufsize: usize) -> &mut Self {
        self.bufsize = bufsize;
        self
    }

    pub fn set_single_process(&mut self, enable: bool) -> &mut Self {
        self.single_process = enable;
        self
    }

    pub fn set_transcript(&mut self, enable: bool) -> &mut Self {
        self.transcript = enable;
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("address", &self.address)
            .field("socket_type", &self.socket_type)
            .field("bufsize", &self.bufsize)
            .field("single_process", &self.single_process)
            .field("transcript", &self.transcript)
            .field("timeout", &self.timeout)
            .field("acl", &self.acl.is_some())
            .finish()
    }
}

/// Evaluate `acl` for `peer`. Evaluation errors deny; an undefined result
/// allows.
pub(crate) fn check_acl(acl: Option<&dyn AccessControl>, peer: &PeerAddr) -> bool {
    let Some(acl) = acl else {
        return true;
    };
    match acl.evaluate(peer) {
        Ok(AclResult::Accept) => true,
        Ok(AclResult::Undefined) => {
            info!("{}: undefined ACL result; access allowed", peer);
            true
        }
        Ok(AclResult::Deny) => {
            error!("access from {} blocked", peer);
            false
        }
        Err(e) => {
            error!("access from {} blocked: cannot check ACLs: {}", peer, e);
            false
        }
    }
}

/// State shared by the gates of every listener of one supervisor
pub(crate) struct Dispatch {
    pub acl: Option<Rc<dyn AccessControl>>,
    pub handler: ConnectionHandler,
    pub prefork: Option<PreforkHook>,
    pub table: SharedTable,
    pub relay: SignalRelay,
}

/// Outcome of the admission checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Drop the connection
    Reject,
    /// Serve it in this process
    Inline,
    /// Fork a worker for it
    Spawn,
    /// Worker ceiling reached: wait for a signal, then drop it
    Throttle,
    /// Stop was requested: drop it and leave the loop
    Shutdown,
}

/// Connection callback of one listener
pub(crate) struct Gate {
    dispatch: Rc<Dispatch>,
    config: ListenerConfig,
}

impl Gate {
    pub(crate) fn new(dispatch: Rc<Dispatch>, config: ListenerConfig) -> Self {
        Self { dispatch, config }
    }

    fn run_prefork(&self, conn: &Connection) -> bool {
        match &self.dispatch.prefork {
            Some(hook) => hook(conn, &self.config),
            None => true,
        }
    }

    pub(crate) fn decide(&self, conn: &Connection) -> Decision {
        let acl = self.config.acl.as_deref().or(self.dispatch.acl.as_deref());
        if !check_acl(acl, conn.peer()) {
            return Decision::Reject;
        }

        if self.config.single_process {
            return if self.run_prefork(conn) {
                Decision::Inline
            } else {
                Decision::Reject
            };
        }

        if registry::idle_hook() {
            return Decision::Shutdown;
        }
        if lock(&self.dispatch.table).pool.is_full() {
            return Decision::Throttle;
        }
        if !self.run_prefork(conn) {
            debug!("connection from {} vetoed", conn.peer());
            return Decision::Reject;
        }
        Decision::Spawn
    }

    /// Readiness callback: accept one connection and admit it
    pub(crate) fn on_ready(&self, listener: &mut Listener) -> ConnAction {
        let mut conn = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return self.continue_or_stop(),
            Err(e) => {
                error!("accept on {}: {}", listener.address_string(), e);
                return ConnAction::Close;
            }
        };
        if let Err(e) = conn.set_timeout(Some(self.config.timeout)) {
            warn!("cannot set timeout for {}: {}", conn.peer(), e);
        }
        conn.set_transcript(self.config.transcript);

        match self.admit(conn, listener) {
            ConnAction::Continue => self.continue_or_stop(),
            action => action,
        }
    }

    fn continue_or_stop(&self) -> ConnAction {
        if signals::stop_requested() {
            ConnAction::Shutdown
        } else {
            ConnAction::Continue
        }
    }

    fn admit(&self, conn: Connection, listener: &mut Listener) -> ConnAction {
        match self.decide(&conn) {
            Decision::Reject => {}
            Decision::Inline => {
                let status = self.serve(conn);
                debug!("{}: session finished with code {}", self.config.address, status);
            }
            Decision::Shutdown => return ConnAction::Shutdown,
            Decision::Throttle => {
                let count = lock(&self.dispatch.table).pool.count();
                error!("too many children ({})", count);
                pause();
            }
            Decision::Spawn => {
                if let Err(e) = self.spawn(conn, listener) {
                    error!("{}", e);
                }
            }
        }
        ConnAction::Continue
    }

    fn serve(&self, conn: Connection) -> i32 {
        let handler = &self.dispatch.handler;
        panic::catch_unwind(AssertUnwindSafe(|| handler(conn, &self.config))).unwrap_or_else(|_| {
            error!("{}: connection handler panicked", self.config.address);
            EX_SOFTWARE
        })
    }

    fn spawn(&self, conn: Connection, listener: &mut Listener) -> Result<Pid> {
        // SAFETY: the child never returns into the event loop; it serves the
        // connection and exits.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // Datagram replies go out through the listening socket itself
                if listener.socket_type() == SocketType::Stream {
                    listener.shutdown();
                }
                if let Err(e) = self.dispatch.relay.restore() {
                    error!("{}", e);
                }
                let status = self.serve(conn);
                std::process::exit(status);
            }
            Ok(ForkResult::Parent { child }) => {
                debug!("connection from {} handed to process {}", conn.peer(), child);
                // register() logs a full table itself
                let _ = lock(&self.dispatch.table).pool.register(child);
                Ok(child)
            }
            Err(e) => Err(Error::Spawn(format!(
                "cannot fork worker for {}: {}",
                conn.peer(),
                e
            ))),
        }
    }
}
