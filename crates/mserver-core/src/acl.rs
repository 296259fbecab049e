//! Access control lists
//!
//! An ACL is an ordered list of `allow`/`deny` rules matched against the
//! peer address of a connection. The first matching rule decides; when none
//! matches the result is [`AclResult::Undefined`] and the caller chooses.

use ipnet::IpNet;
use mserver_common::config::AclRule;
use mserver_common::types::{AclAction, PeerAddr};
use mserver_common::{Error, Result};
use std::fmt;
use std::net::IpAddr;

/// Outcome of an ACL check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclResult {
    Accept,
    Deny,
    Undefined,
}

/// Anything that can decide whether a peer may connect
pub trait AccessControl {
    /// Evaluate the policy for `peer`
    fn evaluate(&self, peer: &PeerAddr) -> Result<AclResult>;
}

/// What a rule matches against
#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Any,
    Unix,
    Net(IpNet),
}

impl Matcher {
    fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        match text {
            "any" | "all" => return Ok(Matcher::Any),
            "unix" => return Ok(Matcher::Unix),
            _ => {}
        }
        if let Ok(net) = text.parse::<IpNet>() {
            return Ok(Matcher::Net(net.trunc()));
        }
        text.parse::<IpAddr>()
            .map(|ip| Matcher::Net(IpNet::from(ip)))
            .map_err(|_| Error::Acl(format!("invalid address or network: {}", text)))
    }

    fn matches(&self, peer: &PeerAddr) -> bool {
        match (self, peer) {
            (Matcher::Any, _) => true,
            (Matcher::Unix, PeerAddr::Unix(_)) => true,
            (Matcher::Net(net), PeerAddr::Inet(addr)) => {
                let ip = match addr.ip() {
                    IpAddr::V6(v6) => v6
                        .to_ipv4_mapped()
                        .map(IpAddr::V4)
                        .unwrap_or(IpAddr::V6(v6)),
                    v4 => v4,
                };
                net.contains(&ip)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Any => write!(f, "any"),
            Matcher::Unix => write!(f, "unix"),
            Matcher::Net(net) => write!(f, "{}", net),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AclEntry {
    action: AclAction,
    matcher: Matcher,
}

/// Ordered rule list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    entries: Vec<AclEntry>,
}

impl Acl {
    /// Create an empty ACL
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an ACL from configuration rules
    pub fn from_rules(rules: &[AclRule]) -> Result<Self> {
        let mut acl = Self::new();
        for rule in rules {
            acl.append(rule.action, &rule.from)?;
        }
        Ok(acl)
    }

    /// Append a rule
    pub fn append(&mut self, action: AclAction, from: &str) -> Result<()> {
        let matcher = Matcher::parse(from)?;
        self.entries.push(AclEntry { action, matcher });
        Ok(())
    }

    /// Insert a rule before every other rule
    pub fn prepend(&mut self, action: AclAction, from: &str) -> Result<()> {
        let matcher = Matcher::parse(from)?;
        self.entries.insert(0, AclEntry { action, matcher });
        Ok(())
    }

    /// Builder form of [`Acl::append`] with `allow`
    pub fn allow(mut self, from: &str) -> Result<Self> {
        self.append(AclAction::Allow, from)?;
        Ok(self)
    }

    /// Builder form of [`Acl::append`] with `deny`
    pub fn deny(mut self, from: &str) -> Result<Self> {
        self.append(AclAction::Deny, from)?;
        Ok(self)
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ACL has no rules
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AccessControl for Acl {
    fn evaluate(&self, peer: &PeerAddr) -> Result<AclResult> {
        let result = self
            .entries
            .iter()
            .find(|entry| entry.matcher.matches(peer))
            .map(|entry| match entry.action {
                AclAction::Allow => AclResult::Accept,
                AclAction::Deny => AclResult::Deny,
            })
            .unwrap_or(AclResult::Undefined);
        Ok(result)
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{} from {}", entry.action, entry.matcher)?;
        }
        Ok(())
    }
}
