//! Common types for mserver

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Address of the remote end of an accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    /// IPv4 or IPv6 peer
    Inet(SocketAddr),
    /// UNIX domain peer; clients rarely bind a path, so it is usually absent
    Unix(Option<PathBuf>),
    /// Peer could not be determined (e.g. interactive mode on a terminal)
    Unknown,
}

impl PeerAddr {
    /// IP address of the peer, if it has one
    pub fn ip(&self) -> Option<std::net::IpAddr> {
        match self {
            PeerAddr::Inet(addr) => Some(addr.ip()),
            _ => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{}", addr),
            PeerAddr::Unix(Some(path)) => write!(f, "unix://{}", path.display()),
            PeerAddr::Unix(None) => write!(f, "unix://[unnamed]"),
            PeerAddr::Unknown => write!(f, "[unknown]"),
        }
    }
}

/// Action attached to an access control rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Allow,
    Deny,
}

impl fmt::Display for AclAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclAction::Allow => write!(f, "allow"),
            AclAction::Deny => write!(f, "deny"),
        }
    }
}

/// Kind of listening socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    /// Connection-oriented; one accepted connection per worker
    #[default]
    #[serde(alias = "tcp")]
    Stream,
    /// One received datagram per worker
    #[serde(alias = "udp")]
    Datagram,
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketType::Stream => write!(f, "stream"),
            SocketType::Datagram => write!(f, "datagram"),
        }
    }
}

/// How the daemon serves connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Stand-alone supervisor accepting on its own sockets
    #[default]
    Daemon,
    /// Started by inetd: one connection on stdin/stdout
    Inetd,
    /// Same as inetd, for running by hand on a terminal
    Interactive,
}

impl ServerMode {
    /// Whether this mode serves a single session on stdin/stdout
    pub fn is_stdio(self) -> bool {
        matches!(self, ServerMode::Inetd | ServerMode::Interactive)
    }
}
