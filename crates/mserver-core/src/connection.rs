//! Accepted connections
//!
//! A [`Connection`] is what a connection handler receives: a byte stream
//! plus the peer address. With transcript mode on, every read and write is
//! logged at debug level.
//!
//! On a datagram listener the connection wraps one received datagram:
//! reads return its payload followed by end-of-file and every write is sent
//! back to the peer as a separate datagram.

use mserver_common::types::PeerAddr;
use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp {
        socket: UdpSocket,
        peer: SocketAddr,
        payload: Cursor<Vec<u8>>,
    },
    UnixDatagram {
        socket: UnixDatagram,
        peer: Option<PathBuf>,
        payload: Cursor<Vec<u8>>,
    },
    /// stdin/stdout of an interactive session
    Stdio,
}

/// A client connection handed to the connection handler
#[derive(Debug)]
pub struct Connection {
    stream: Stream,
    peer: PeerAddr,
    transcript: bool,
}

impl Connection {
    pub(crate) fn tcp(stream: TcpStream, peer: PeerAddr) -> Self {
        Self {
            stream: Stream::Tcp(stream),
            peer,
            transcript: false,
        }
    }

    pub(crate) fn unix(stream: UnixStream, peer: PeerAddr) -> Self {
        Self {
            stream: Stream::Unix(stream),
            peer,
            transcript: false,
        }
    }

    pub(crate) fn udp(socket: UdpSocket, peer: SocketAddr, payload: Vec<u8>) -> Self {
        Self {
            stream: Stream::Udp {
                socket,
                peer,
                payload: Cursor::new(payload),
            },
            peer: PeerAddr::Inet(peer),
            transcript: false,
        }
    }

    pub(crate) fn unix_datagram(
        socket: UnixDatagram,
        peer: Option<PathBuf>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            stream: Stream::UnixDatagram {
                socket,
                peer: peer.clone(),
                payload: Cursor::new(payload),
            },
            peer: PeerAddr::Unix(peer),
            transcript: false,
        }
    }

    /// Connection over the process' standard streams, as started by inetd.
    ///
    /// When stdin is an IP socket the peer address is taken from it and all
    /// I/O goes through the socket; otherwise stdin is read and stdout is
    /// written with an unknown peer.
    pub fn stdio() -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        let socket = TcpStream::from(fd);
        let connection = match socket.peer_addr() {
            Ok(addr) => Self::tcp(socket, PeerAddr::Inet(addr)),
            Err(_) => Self {
                stream: Stream::Stdio,
                peer: PeerAddr::Unknown,
                transcript: false,
            },
        };
        Ok(connection)
    }

    /// Peer address
    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// The received datagram, on datagram listeners
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.stream {
            Stream::Udp { payload, .. } | Stream::UnixDatagram { payload, .. } => {
                Some(payload.get_ref().as_slice())
            }
            _ => None,
        }
    }

    /// Whether the session transcript is logged
    pub fn transcript(&self) -> bool {
        self.transcript
    }

    /// Enable or disable the session transcript
    pub fn set_transcript(&mut self, enable: bool) {
        self.transcript = enable;
    }

    /// Apply an idle timeout to reads; `None` or zero means wait forever.
    /// Datagram payloads are already in memory, so it does not apply to them.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        match &self.stream {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            Stream::Unix(s) => s.set_read_timeout(timeout),
            Stream::Udp { .. } | Stream::UnixDatagram { .. } | Stream::Stdio => Ok(()),
        }
    }

    /// Independent handle to the same stream, e.g. to split reader and writer
    pub fn try_clone(&self) -> io::Result<Self> {
        let stream = match &self.stream {
            Stream::Tcp(s) => Stream::Tcp(s.try_clone()?),
            Stream::Unix(s) => Stream::Unix(s.try_clone()?),
            Stream::Udp {
                socket,
                peer,
                payload,
            } => Stream::Udp {
                socket: socket.try_clone()?,
                peer: *peer,
                payload: payload.clone(),
            },
            Stream::UnixDatagram {
                socket,
                peer,
                payload,
            } => Stream::UnixDatagram {
                socket: socket.try_clone()?,
                peer: peer.clone(),
                payload: payload.clone(),
            },
            Stream::Stdio => Stream::Stdio,
        };
        Ok(Self {
            stream,
            peer: self.peer.clone(),
            transcript: self.transcript,
        })
    }

    fn log(&self, direction: &str, data: &[u8]) {
        if self.transcript && !data.is_empty() {
            let text = String::from_utf8_lossy(data);
            debug!(peer = %self.peer, "{}: {}", direction, text.trim_end_matches(['\r', '\n']));
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &mut self.stream {
            Stream::Tcp(s) => s.read(buf)?,
            Stream::Unix(s) => s.read(buf)?,
            Stream::Udp { payload, .. } | Stream::UnixDatagram { payload, .. } => {
                payload.read(buf)?
            }
            Stream::Stdio => io::stdin().read(buf)?,
        };
        self.log("recv", &buf[..n]);
        Ok(n)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.stream {
            Stream::Tcp(s) => s.write(buf)?,
            Stream::Unix(s) => s.write(buf)?,
            Stream::Udp { socket, peer, .. } => socket.send_to(buf, *peer)?,
            Stream::UnixDatagram { socket, peer, .. } => match peer {
                Some(path) => socket.send_to(buf, path)?,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "peer has no address to reply to",
                    ))
                }
            },
            Stream::Stdio => io::stdout().write(buf)?,
        };
        self.log("send", &buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stream {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
            Stream::Udp { .. } | Stream::UnixDatagram { .. } => Ok(()),
            Stream::Stdio => io::stdout().flush(),
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        match &self.stream {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
            Stream::Udp { socket, .. } => socket.as_raw_fd(),
            Stream::UnixDatagram { socket, .. } => socket.as_raw_fd(),
            Stream::Stdio => io::stdin().as_raw_fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};

    #[test]
    fn test_unix_pair_roundtrip() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut server = Connection::unix(left, PeerAddr::Unix(None));
        server.set_transcript(true);
        assert!(server.transcript());

        let mut client = right;
        client.write_all(b"HELO\r\n").unwrap();

        let mut reader = BufReader::new(server.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "HELO\r\n");

        server.write_all(b"+OK\r\n").unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"+OK\r\n");
    }

    #[test]
    fn test_read_timeout() {
        let (left, _right) = UnixStream::pair().unwrap();
        let mut conn = Connection::unix(left, PeerAddr::Unix(None));
        conn.set_timeout(Some(Duration::from_millis(20))).unwrap();

        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));

        // Zero disables the timeout instead of failing
        conn.set_timeout(Some(Duration::ZERO)).unwrap();
        assert!(conn.payload().is_none());
    }

    #[test]
    fn test_udp_payload_and_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let client_addr = client.local_addr().unwrap();

        let mut conn = Connection::udp(server, client_addr, b"ping\n".to_vec());
        assert_eq!(conn.peer(), &PeerAddr::Inet(client_addr));
        assert_eq!(conn.payload(), Some(&b"ping\n"[..]));

        let mut body = String::new();
        conn.try_clone().unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "ping\n");
        // The clone has its own cursor
        assert_eq!(conn.payload(), Some(&b"ping\n"[..]));

        conn.write_all(b"pong\n").unwrap();
        let mut reply = [0u8; 16];
        let (n, _) = client.recv_from(&mut reply).unwrap();
        assert_eq!(&reply[..n], b"pong\n");
    }

    #[test]
    fn test_unnamed_unix_datagram_peer_cannot_be_answered() {
        let (server, _client) = UnixDatagram::pair().unwrap();
        let mut conn = Connection::unix_datagram(server, None, b"hi".to_vec());
        assert_eq!(conn.peer(), &PeerAddr::Unix(None));

        let mut body = Vec::new();
        conn.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hi");
        let err = conn.write(b"reply").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
