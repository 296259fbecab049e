//! mserver Core - multi-process network service supervisor
//!
//! This crate turns listening sockets into a running service: it accepts
//! connections, admits or rejects them, hands each to a worker process,
//! bounds concurrency, reaps finished workers and shuts down cleanly.

pub mod acl;
pub mod address;
pub mod connection;
pub mod daemon;
pub mod exit;
pub mod gate;
pub mod listener;
pub mod mux;
pub mod pool;
pub mod registry;
pub mod signals;
pub mod supervisor;

pub use acl::{AccessControl, Acl, AclResult};
pub use address::{parse_address, resolve_port, AddressHints};
pub use connection::Connection;
pub use exit::{describe_exit, ExitTranslator};
pub use gate::{ConnectionHandler, ListenerConfig, PreforkHook};
pub use listener::{Endpoint, Listener};
pub use mux::{ConnAction, Multiplexer};
pub use pool::ProcessPool;
pub use registry::{idle_hook, supervisor_count, SupervisorId};
pub use signals::{request_stop, stop_requested, SignalRelay};
pub use supervisor::Supervisor;

pub use mserver_common::types::SocketType;
