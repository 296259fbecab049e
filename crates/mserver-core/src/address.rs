//! Listening address parsing
//!
//! Accepted forms:
//!
//! ```text
//! /var/run/pop3d.sock        UNIX socket
//! unix:///var/run/pop3d.sock UNIX socket
//! inet://host[:port]         IP socket
//! host[:port], [v6]:port     IP socket
//! ```
//!
//! Ports may be numbers or service names. A missing port falls back to the
//! supervisor's default.

use crate::listener::Endpoint;
use mserver_common::types::SocketType;
use mserver_common::{Error, Result};
use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use tracing::warn;

/// Default bind hints for listeners without an explicit address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressHints {
    /// Default port
    pub port: Option<u16>,
    /// Address used for passive (wildcard) listeners
    pub passive: IpAddr,
    /// Socket type of the synthesized wildcard listener
    pub socket_type: SocketType,
}

impl Default for AddressHints {
    fn default() -> Self {
        Self {
            port: None,
            passive: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            socket_type: SocketType::Stream,
        }
    }
}

impl AddressHints {
    /// Wildcard endpoint on the default port
    pub fn passive_endpoint(&self) -> Result<Endpoint> {
        let port = self.port.ok_or_else(|| {
            Error::Address("no listener configured and no default port set".to_string())
        })?;
        Ok(Endpoint::Inet(SocketAddr::new(self.passive, port)))
    }
}

/// Resolve a port given as a number or as a TCP service name
pub fn resolve_port(text: &str) -> Result<u16> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::Address("empty port".to_string()));
    }
    if text.bytes().all(|b| b.is_ascii_digit()) {
        return text
            .parse::<u16>()
            .map_err(|_| Error::Address(format!("invalid port number: {}", text)));
    }

    let name = CString::new(text).map_err(|_| Error::Address(format!("invalid service: {}", text)))?;
    let proto = CString::new("tcp").map_err(|e| Error::Internal(e.to_string()))?;
    // SAFETY: both pointers are valid NUL-terminated strings; the returned
    // entry is copied out before any other call into the services database.
    let port = unsafe {
        let entry = libc::getservbyname(name.as_ptr(), proto.as_ptr());
        if entry.is_null() {
            None
        } else {
            Some(u16::from_be((*entry).s_port as u16))
        }
    };
    port.ok_or_else(|| Error::Address(format!("unknown service: {}", text)))
}

/// Parse a listening address, filling in `default_port` when none is given
pub fn parse_address(text: &str, default_port: Option<u16>) -> Result<Endpoint> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::Address("empty address".to_string()));
    }
    if text.starts_with('/') {
        return Ok(Endpoint::Unix(PathBuf::from(text)));
    }
    if let Some(path) = text.strip_prefix("unix://") {
        if !path.starts_with('/') {
            return Err(Error::Address(format!("UNIX socket path must be absolute: {}", text)));
        }
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }
    let rest = match text.strip_prefix("inet://") {
        Some(rest) => rest,
        None if text.contains("://") => {
            return Err(Error::Address(format!("unsupported address scheme: {}", text)))
        }
        None => text,
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = split_host_port(rest)?;
    let port = match port {
        Some(port) => resolve_port(port)?,
        None => default_port
            .ok_or_else(|| Error::Address(format!("{}: no port given and no default port", text)))?,
    };

    let host = match host {
        "" | "*" => "0.0.0.0",
        host => host,
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(Endpoint::Inet(SocketAddr::new(ip, port)));
    }

    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Address(format!("cannot resolve {}: {}", host, e)))?;
    let first = addrs
        .next()
        .ok_or_else(|| Error::Address(format!("{} does not resolve to any address", host)))?;
    if addrs.next().is_some() {
        warn!("{} resolves to several addresses, only the first is used", text);
    }
    Ok(Endpoint::Inet(first))
}

fn split_host_port(text: &str) -> Result<(&str, Option<&str>)> {
    if let Some(rest) = text.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::Address(format!("unterminated IPv6 address: {}", text)))?;
        return match tail {
            "" => Ok((host, None)),
            tail => match tail.strip_prefix(':') {
                Some(port) => Ok((host, Some(port))),
                None => Err(Error::Address(format!("garbage after IPv6 address: {}", text))),
            },
        };
    }
    match text.matches(':').count() {
        0 => Ok((text, None)),
        1 => {
            let (host, port) = text.split_once(':').unwrap_or((text, ""));
            Ok((host, Some(port)))
        }
        // Bare IPv6 address
        _ => Ok((text, None)),
    }
}
