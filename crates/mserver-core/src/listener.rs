//! Listening sockets
//!
//! A stream listener hands out one accepted connection per readiness event.
//! A datagram listener receives one datagram into a buffer of the
//! configured size and hands out a connection wrapping it.

use crate::connection::Connection;
use mserver_common::types::{PeerAddr, SocketType};
use mserver_common::{Error, Result};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Receive buffer size of datagram listeners
pub const DEFAULT_BUFSIZE: usize = 4096;

/// Where a listener binds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet(addr) => write!(f, "inet://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug)]
enum Socket {
    Tcp(TcpListener),
    Unix(UnixListener),
    Udp(UdpSocket),
    UnixDatagram(UnixDatagram),
}

/// A socket that can be opened, accepted on and shut down
#[derive(Debug)]
pub struct Listener {
    endpoint: Endpoint,
    socket_type: SocketType,
    bufsize: usize,
    socket: Option<Socket>,
}

impl Listener {
    /// Create a closed stream listener for `endpoint`
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_type(endpoint, SocketType::Stream)
    }

    /// Create a closed listener of the given type
    pub fn with_type(endpoint: Endpoint, socket_type: SocketType) -> Self {
        Self {
            endpoint,
            socket_type,
            bufsize: DEFAULT_BUFSIZE,
            socket: None,
        }
    }

    /// Configured endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    /// Receive buffer size; only datagram listeners use it
    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Change the receive buffer size. Zero is rejected.
    pub fn set_bufsize(&mut self, bufsize: usize) -> Result<()> {
        if bufsize == 0 {
            return Err(Error::Listener(format!(
                "{}: buffer size must be greater than zero",
                self.endpoint
            )));
        }
        self.bufsize = bufsize;
        Ok(())
    }

    /// Printable address
    pub fn address_string(&self) -> String {
        self.endpoint.to_string()
    }

    /// Whether the socket is open
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Address actually bound; differs from the endpoint for port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.socket {
            Some(Socket::Tcp(l)) => l.local_addr().ok(),
            Some(Socket::Udp(s)) => s.local_addr().ok(),
            _ => None,
        }
    }

    /// Bind and listen.
    ///
    /// A stale UNIX socket file is removed first; any other file at that
    /// path makes the open fail.
    pub fn open(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Err(Error::Listener(format!("{} is already open", self.endpoint)));
        }
        debug!("opening server {}", self.endpoint);

        let socket = match (&self.endpoint, self.socket_type) {
            (Endpoint::Inet(addr), SocketType::Stream) => Socket::Tcp(TcpListener::bind(addr)?),
            (Endpoint::Inet(addr), SocketType::Datagram) => Socket::Udp(UdpSocket::bind(addr)?),
            (Endpoint::Unix(path), SocketType::Stream) => {
                remove_stale_socket(path)?;
                Socket::Unix(UnixListener::bind(path)?)
            }
            (Endpoint::Unix(path), SocketType::Datagram) => {
                remove_stale_socket(path)?;
                Socket::UnixDatagram(UnixDatagram::bind(path)?)
            }
        };
        self.socket = Some(socket);
        Ok(())
    }

    /// Accept one connection, or receive one datagram
    pub fn accept(&self) -> io::Result<Connection> {
        match &self.socket {
            Some(Socket::Udp(socket)) => {
                let mut buf = vec![0u8; self.bufsize];
                let (n, peer) = socket.recv_from(&mut buf)?;
                buf.truncate(n);
                Ok(Connection::udp(socket.try_clone()?, peer, buf))
            }
            Some(Socket::UnixDatagram(socket)) => {
                let mut buf = vec![0u8; self.bufsize];
                let (n, peer) = socket.recv_from(&mut buf)?;
                buf.truncate(n);
                let peer = peer.as_pathname().map(Path::to_path_buf);
                Ok(Connection::unix_datagram(socket.try_clone()?, peer, buf))
            }
            Some(Socket::Tcp(l)) => {
                let (stream, addr) = l.accept()?;
                Ok(Connection::tcp(stream, PeerAddr::Inet(addr)))
            }
            Some(Socket::Unix(l)) => {
                let (stream, addr) = l.accept()?;
                let peer = PeerAddr::Unix(addr.as_pathname().map(|p| p.to_path_buf()));
                Ok(Connection::unix(stream, peer))
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener is not open",
            )),
        }
    }

    /// Close this process' copy of the socket
    pub fn shutdown(&mut self) {
        if self.socket.take().is_some() {
            debug!("closing server {}", self.endpoint);
        }
    }

    /// Descriptor for readiness polling
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.socket {
            Some(Socket::Tcp(l)) => Some(l.as_fd()),
            Some(Socket::Unix(l)) => Some(l.as_fd()),
            Some(Socket::Udp(s)) => Some(s.as_fd()),
            Some(Socket::UnixDatagram(s)) => Some(s.as_fd()),
            None => None,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let bound = matches!(
            self.socket,
            Some(Socket::Unix(_)) | Some(Socket::UnixDatagram(_))
        );
        if let (true, Endpoint::Unix(path)) = (bound, &self.endpoint) {
            // Only the process that bound the socket removes the file;
            // forked workers leave without running destructors.
            if let Err(e) = std::fs::remove_file(path) {
                error!("cannot remove socket {}: {}", path.display(), e);
            }
        }
    }
}

/// Remove a socket file left behind by a previous run. Any other kind of
/// file at `path` is an error.
fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path).map_err(|e| {
            Error::Listener(format!("cannot unlink file {}: {}", path.display(), e))
        }),
        Ok(_) => Err(Error::Listener(format!(
            "file {} is not a socket",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Listener(format!(
            "file {} exists but cannot be stat'd: {}",
            path.display(),
            e
        ))),
    }
}
