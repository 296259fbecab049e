//! Configuration for mserver
//!
//! The file has one `[server]` section with the settings shared by every
//! listener, any number of `[[listener]]` sections, and a `[logging]`
//! section read by the daemon binary.

use crate::types::{AclAction, ServerMode, SocketType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Global server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Listening sockets
    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenerSettings>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Global server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Name used in log messages
    #[serde(default)]
    pub ident: Option<String>,

    /// Maximum number of worker processes to run simultaneously (0 = no limit)
    #[serde(default)]
    pub max_children: usize,

    /// Daemon mode
    #[serde(default)]
    pub mode: ServerMode,

    /// Stay in foreground instead of detaching
    #[serde(default)]
    pub foreground: bool,

    /// Store the PID of the master process in this file
    #[serde(default)]
    pub pidfile: Option<PathBuf>,

    /// Default port: a number or a service name
    #[serde(default)]
    pub port: Option<String>,

    /// Default socket type of listeners
    #[serde(default, rename = "type")]
    pub socket_type: SocketType,

    /// Default idle timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Global access control list
    #[serde(default)]
    pub acl: Vec<AclRule>,

    /// Signals that stop the server (SIGCHLD is always handled as well)
    #[serde(default = "default_signals")]
    pub signals: Vec<String>,

    /// Longest wait between two idle-hook runs, in milliseconds
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ident: None,
            max_children: 0,
            mode: ServerMode::default(),
            foreground: false,
            pidfile: None,
            port: None,
            socket_type: SocketType::default(),
            timeout: default_timeout(),
            acl: Vec::new(),
            signals: default_signals(),
            idle_interval_ms: default_idle_interval(),
        }
    }
}

fn default_timeout() -> u64 {
    600
}

fn default_signals() -> Vec<String> {
    ["SIGINT", "SIGTERM", "SIGQUIT", "SIGHUP"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_idle_interval() -> u64 {
    1000
}

/// Per-listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// `host[:port]`, `inet://host[:port]`, `unix:///path` or `/path`
    pub address: String,

    /// Socket type; inherits the server default when absent
    #[serde(default, rename = "type")]
    pub socket_type: Option<SocketType>,

    /// Receive buffer size of datagram listeners, in bytes
    #[serde(default)]
    pub bufsize: Option<usize>,

    /// Handle connections inside the supervisor instead of forking
    #[serde(default)]
    pub single_process: bool,

    /// Log the session transcript
    #[serde(default)]
    pub transcript: bool,

    /// Idle timeout in seconds; inherits the global one when absent
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Access control list overriding the global one
    #[serde(default)]
    pub acl: Option<Vec<AclRule>>,
}

/// A single access control rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    /// What to do when the rule matches
    pub action: AclAction,
    /// `any`, `unix`, an IP address or a CIDR network
    pub from: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Append log records to this file. Required when the server detaches
    /// from the terminal, since its standard streams are closed then.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from a file, overridden by `MSERVER__SECTION__KEY`
    /// environment variables
    pub fn load_layered(path: &Path) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("MSERVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./mserver.toml"),
            PathBuf::from("/etc/mserver/mserver.toml"),
        ];

        for path in paths {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load_layered(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Semantic checks that serde cannot express. All problems are reported
    /// at once.
    pub fn validate(&self) -> crate::Result<()> {
        let mut problems = Vec::new();

        if self.server.idle_interval_ms == 0 {
            problems.push("server.idle_interval_ms must be greater than zero".to_string());
        }

        for name in &self.server.signals {
            let upper = name.to_ascii_uppercase();
            if upper == "SIGKILL" || upper == "SIGSTOP" {
                problems.push(format!("signal {} cannot be intercepted", name));
            }
        }

        let mut seen = HashSet::new();
        for listener in &self.listeners {
            if listener.address.trim().is_empty() {
                problems.push("listener address must not be empty".to_string());
            } else if !seen.insert(listener.address.as_str()) {
                problems.push(format!("duplicate listener address {}", listener.address));
            }
            if listener.bufsize == Some(0) {
                problems.push(format!(
                    "listener {}: bufsize must be greater than zero",
                    listener.address
                ));
            }
        }

        if self.logging.format != "json" && self.logging.format != "text" {
            problems.push(format!("unknown log format {}", self.logging.format));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(crate::Error::Config(problems.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let server = ServerSettings::default();
        assert_eq!(server.max_children, 0);
        assert_eq!(server.timeout, 600);
        assert_eq!(server.mode, ServerMode::Daemon);
        assert_eq!(
            server.signals,
            vec!["SIGINT", "SIGTERM", "SIGQUIT", "SIGHUP"]
        );
        assert!(!server.foreground);
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
ident = "pop3d"
max_children = 20
foreground = true
pidfile = "/var/run/pop3d.pid"
port = "pop3"
timeout = 300
acl = [
    { action = "allow", from = "10.0.0.0/8" },
    { action = "deny", from = "any" },
]

[[listener]]
address = "127.0.0.1:1110"
transcript = true

[[listener]]
address = "/var/run/pop3d.sock"
single_process = true
timeout = 30
acl = [{ action = "allow", from = "unix" }]

[[listener]]
address = "127.0.0.1:1514"
type = "udp"
bufsize = 512

[logging]
file = "/var/log/pop3d.log"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.ident.as_deref(), Some("pop3d"));
        assert_eq!(config.server.max_children, 20);
        assert_eq!(config.server.port.as_deref(), Some("pop3"));
        assert_eq!(config.server.acl.len(), 2);
        assert_eq!(config.server.acl[1].action, AclAction::Deny);
        assert_eq!(config.server.socket_type, SocketType::Stream);
        assert_eq!(config.listeners.len(), 3);
        assert!(config.listeners[0].transcript);
        assert_eq!(config.listeners[0].socket_type, None);
        assert_eq!(config.listeners[0].timeout, None);
        assert!(config.listeners[1].single_process);
        assert_eq!(config.listeners[1].timeout, Some(30));
        assert_eq!(
            config.listeners[1].acl,
            Some(vec![AclRule {
                action: AclAction::Allow,
                from: "unix".to_string()
            }])
        );
        assert_eq!(config.listeners[2].socket_type, Some(SocketType::Datagram));
        assert_eq!(config.listeners[2].bufsize, Some(512));
        assert_eq!(
            config.logging.file.as_deref(),
            Some(Path::new("/var/log/pop3d.log"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_mode() {
        let config: Config = toml::from_str("[server]\nmode = \"inetd\"\n").unwrap();
        assert_eq!(config.server.mode, ServerMode::Inetd);

        let bad: std::result::Result<Config, _> = toml::from_str("[server]\nmode = \"bogus\"\n");
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = Config::default();
        config.server.idle_interval_ms = 0;
        config.server.signals.push("SIGKILL".to_string());
        for _ in 0..2 {
            config.listeners.push(ListenerSettings {
                address: "0.0.0.0:110".to_string(),
                socket_type: None,
                bufsize: Some(0),
                single_process: false,
                transcript: false,
                timeout: None,
                acl: None,
            });
        }

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("idle_interval_ms"));
        assert!(err.contains("SIGKILL"));
        assert!(err.contains("duplicate listener address 0.0.0.0:110"));
        assert!(err.contains("bufsize must be greater than zero"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nmax_children = 3\n\n[[listener]]\naddress = \"localhost:2110\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.max_children, 3);
        assert_eq!(config.listeners[0].address, "localhost:2110");

        let missing = Config::from_file(Path::new("/nonexistent/mserver.toml"));
        assert!(matches!(missing, Err(crate::Error::Config(_))));
    }
}
