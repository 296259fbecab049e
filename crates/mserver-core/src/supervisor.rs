//! The supervisor
//!
//! Owns the staged listeners, the worker table and the signal relay, and
//! drives the service through `start` → `run` → `stop`:
//!
//! 1. `start` synthesizes a wildcard listener when none was added, detaches
//!    from the terminal unless running in the foreground, writes the pidfile
//!    and intercepts the configured signals.
//! 2. `run` opens the staged listeners, hands them to the multiplexer with
//!    the admission gate as their callback, and blocks until a stop is
//!    requested. Remaining workers are sent SIGTERM on the way out.
//! 3. `stop` restores the original signal dispositions.

use crate::acl::{AccessControl, Acl};
use crate::address::{self, AddressHints};
use crate::connection::Connection;
use crate::daemon;
use crate::exit::{ExitTranslator, EX_NOPERM};
use crate::gate::{self, ConnectionHandler, Dispatch, Gate, ListenerConfig, PreforkHook};
use crate::listener::{Endpoint, Listener};
use crate::mux::Multiplexer;
use crate::pool::ProcessPool;
use crate::registry::{self, lock, SharedTable, SupervisorId, WorkerTable};
use crate::signals::SignalRelay;
use mserver_common::config::{ListenerSettings, ServerSettings};
use mserver_common::types::{PeerAddr, ServerMode, SocketType};
use mserver_common::{Error, Result};
use nix::sys::signal::Signal;
use nix::sys::stat::{umask, Mode};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Multi-process network service supervisor
pub struct Supervisor {
    id: SupervisorId,
    ident: Option<String>,
    hints: AddressHints,
    timeout: Duration,
    foreground: bool,
    mode: ServerMode,
    pidfile: Option<PathBuf>,
    acl: Option<Rc<dyn AccessControl>>,
    handler: Option<ConnectionHandler>,
    prefork: Option<PreforkHook>,
    staged: Vec<(Listener, ListenerConfig)>,
    mux: Multiplexer,
    table: SharedTable,
    relay: SignalRelay,
}

impl Supervisor {
    /// Create a supervisor and add it to the process-wide registry
    pub fn new(ident: Option<&str>) -> Self {
        let ident = ident.map(str::to_string);
        let table = Arc::new(Mutex::new(WorkerTable {
            ident: ident.clone(),
            pool: ProcessPool::new(0),
            strexit: None,
        }));
        let id = registry::register(table.clone());

        Self {
            id,
            ident,
            hints: AddressHints::default(),
            timeout: DEFAULT_TIMEOUT,
            foreground: false,
            mode: ServerMode::default(),
            pidfile: None,
            acl: None,
            handler: None,
            prefork: None,
            staged: Vec::new(),
            mux: Multiplexer::default(),
            table,
            relay: SignalRelay::default(),
        }
    }

    /// Build a supervisor with every listener of the configuration staged
    pub fn from_config(settings: &ServerSettings, listeners: &[ListenerSettings]) -> Result<Self> {
        let mut sup = Self::new(settings.ident.as_deref());

        if let Some(port) = &settings.port {
            sup.hints.port = Some(address::resolve_port(port)?);
        }
        sup.set_socket_type(settings.socket_type);
        sup.set_timeout(Duration::from_secs(settings.timeout));
        sup.set_max_children(settings.max_children)?;
        sup.set_foreground(settings.foreground);
        sup.set_mode(settings.mode);
        sup.pidfile = settings.pidfile.clone();
        if !settings.acl.is_empty() {
            sup.set_acl(Acl::from_rules(&settings.acl)?);
        }

        let signals = settings
            .signals
            .iter()
            .map(|name| parse_signal(name))
            .collect::<Result<Vec<_>>>()?;
        sup.set_signals(&signals);
        sup.set_idle_interval(Duration::from_millis(settings.idle_interval_ms));

        for settings_entry in listeners {
            let endpoint = sup.parse_address(&settings_entry.address)?;
            let timeout = Duration::from_secs(settings_entry.timeout.unwrap_or(settings.timeout));
            let acl = settings_entry
                .acl
                .as_deref()
                .map(Acl::from_rules)
                .transpose()?;

            let socket_type = settings_entry.socket_type.unwrap_or(settings.socket_type);

            let config = sup.add_listener(endpoint, socket_type);
            if let Some(bufsize) = settings_entry.bufsize {
                config.set_bufsize(bufsize);
            }
            config
                .set_single_process(settings_entry.single_process)
                .set_transcript(settings_entry.transcript)
                .set_timeout(timeout);
            if let Some(acl) = acl {
                config.set_acl(acl);
            }
        }

        debug!(
            "configured {} listener(s), max_children={}",
            sup.configured_count(),
            sup.max_children()
        );
        Ok(sup)
    }

    /// Registry identifier
    pub fn id(&self) -> SupervisorId {
        self.id
    }

    pub fn ident(&self) -> Option<&str> {
        self.ident.as_deref()
    }

    pub fn set_ident(&mut self, ident: Option<&str>) {
        self.ident = ident.map(str::to_string);
        lock(&self.table).ident = self.ident.clone();
    }

    pub fn hints(&self) -> &AddressHints {
        &self.hints
    }

    pub fn set_hints(&mut self, hints: AddressHints) {
        self.hints = hints;
    }

    /// Port used by listeners without one and by the synthesized wildcard
    /// listener
    pub fn set_default_port(&mut self, port: u16) {
        self.hints.port = Some(port);
    }

    /// Default socket type, used by the synthesized wildcard listener
    pub fn socket_type(&self) -> SocketType {
        self.hints.socket_type
    }

    pub fn set_socket_type(&mut self, socket_type: SocketType) {
        self.hints.socket_type = socket_type;
    }

    /// Default idle timeout inherited by listeners added afterwards
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn max_children(&self) -> usize {
        lock(&self.table).pool.capacity()
    }

    /// Set the worker ceiling (0 = unbounded). Fails once workers exist.
    pub fn set_max_children(&mut self, max: usize) -> Result<()> {
        lock(&self.table).pool.resize(max)
    }

    pub fn foreground(&self) -> bool {
        self.foreground
    }

    pub fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ServerMode) {
        self.mode = mode;
    }

    pub fn pidfile(&self) -> Option<&Path> {
        self.pidfile.as_deref()
    }

    pub fn set_pidfile(&mut self, path: impl Into<PathBuf>) {
        self.pidfile = Some(path.into());
    }

    /// ACL used by listeners without their own
    pub fn set_acl(&mut self, acl: impl AccessControl + 'static) {
        self.acl = Some(Rc::new(acl));
    }

    /// Intercepted signals; SIGCHLD is always included
    pub fn signals(&self) -> &[Signal] {
        self.relay.signals()
    }

    pub fn set_signals(&mut self, signals: &[Signal]) {
        self.relay.set_signals(signals);
    }

    /// Longest multiplexer wait between idle-hook runs
    pub fn set_idle_interval(&mut self, interval: Duration) {
        self.mux.set_idle_interval(interval);
    }

    /// Translator used when logging worker exit codes
    pub fn set_strexit(&mut self, strexit: ExitTranslator) {
        lock(&self.table).strexit = Some(strexit);
    }

    /// Set the connection handler. Required before `run`.
    pub fn set_handler<F>(&mut self, handler: F)
    where
        F: Fn(Connection, &ListenerConfig) -> i32 + 'static,
    {
        self.handler = Some(Rc::new(handler));
    }

    /// Set the pre-spawn hook; returning `false` drops the connection
    pub fn set_prefork<F>(&mut self, hook: F)
    where
        F: Fn(&Connection, &ListenerConfig) -> bool + 'static,
    {
        self.prefork = Some(Rc::new(hook));
    }

    /// Parse a listening address using this supervisor's default port
    pub fn parse_address(&self, text: &str) -> Result<Endpoint> {
        address::parse_address(text, self.hints.port)
    }

    /// Stage a listener of the given type. It inherits the default timeout;
    /// the returned record can be adjusted until `run`.
    pub fn add_listener(
        &mut self,
        endpoint: Endpoint,
        socket_type: SocketType,
    ) -> &mut ListenerConfig {
        let config = ListenerConfig::new(endpoint.to_string(), socket_type, self.timeout);
        let index = self.staged.len();
        self.staged
            .push((Listener::with_type(endpoint, socket_type), config));
        &mut self.staged[index].1
    }

    /// Number of staged listeners
    pub fn configured_count(&self) -> usize {
        self.staged.len()
    }

    /// Number of live workers
    pub fn worker_count(&self) -> usize {
        lock(&self.table).pool.count()
    }

    /// Check `peer` against the supervisor ACL
    pub fn check_acl(&self, peer: &PeerAddr) -> bool {
        gate::check_acl(self.acl.as_deref(), peer)
    }

    /// Serve one session on stdin/stdout, as under inetd, and return the
    /// handler's exit status
    pub fn serve_stdio(&self) -> Result<i32> {
        let handler = self.handler.clone().ok_or_else(no_handler)?;
        let mut conn = Connection::stdio()?;
        if !self.check_acl(conn.peer()) {
            return Ok(EX_NOPERM);
        }

        let config = ListenerConfig::new("stdio".to_string(), SocketType::Stream, self.timeout);
        conn.set_timeout(Some(config.timeout))?;
        conn.set_transcript(config.transcript);
        Ok(handler(conn, &config))
    }

    /// Prepare to serve: detach, write the pidfile and intercept signals.
    ///
    /// Failing to detach terminates the process.
    pub fn start(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            let endpoint = self.hints.passive_endpoint()?;
            debug!("no listeners configured, using {}", endpoint);
            let socket_type = self.hints.socket_type;
            self.add_listener(endpoint, socket_type);
        }

        if !self.foreground {
            if let Err(e) = daemon::daemonize() {
                error!("failed to become a daemon: {}", e);
                std::process::exit(1);
            }
        }

        if let Some(path) = &self.pidfile {
            if let Err(e) = daemon::create_pidfile(path) {
                error!("{}", e);
            }
        }

        self.relay.install()
    }

    /// Serve until a stop is requested.
    ///
    /// Consumes the staged listeners. Exits the process when none of them
    /// could be opened.
    pub fn run(&mut self) -> Result<()> {
        let handler = self.handler.clone().ok_or_else(no_handler)?;
        let dispatch = Rc::new(Dispatch {
            acl: self.acl.clone(),
            handler,
            prefork: self.prefork.clone(),
            table: self.table.clone(),
            relay: self.relay.clone(),
        });

        self.open_listeners(&dispatch);
        if self.mux.count() == 0 {
            error!("no servers configured: exiting");
            std::process::exit(1);
        }

        if let Some(ident) = &self.ident {
            info!("{} started", ident);
        }
        let result = self.mux.run(registry::idle_hook);
        lock(&self.table).pool.terminate_all();
        if let Some(ident) = &self.ident {
            info!("{} terminated", ident);
        }
        result
    }

    /// Restore the signal dispositions replaced by `start`
    pub fn stop(&mut self) -> Result<()> {
        self.relay.uninstall()
    }

    /// Open every staged listener and hand it to the multiplexer. Listeners
    /// that fail to open are logged and dropped.
    pub(crate) fn open_listeners(&mut self, dispatch: &Rc<Dispatch>) -> usize {
        let saved = umask(Mode::from_bits_truncate(0o117));
        let mut opened = 0;

        for (mut listener, config) in self.staged.drain(..) {
            let opened_ok = listener
                .set_bufsize(config.bufsize)
                .and_then(|()| listener.open());
            if let Err(e) = opened_ok {
                error!("cannot open connection on {}: {}", listener.address_string(), e);
                continue;
            }
            let gate = Gate::new(dispatch.clone(), config);
            let address = listener.address_string();
            let callback = Box::new(move |listener: &mut Listener| gate.on_ready(listener));
            match self.mux.register_listener(listener, callback) {
                Ok(()) => opened += 1,
                Err(e) => error!("cannot add connection {}: {}", address, e),
            }
        }

        umask(saved);
        opened
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        registry::unregister(self.id);
    }
}

fn no_handler() -> Error {
    Error::Config("no connection handler set".to_string())
}

/// Parse `SIGTERM`, `sigterm` or `TERM`
fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).map_err(|_| Error::Config(format!("unknown signal {}", name)))
}
