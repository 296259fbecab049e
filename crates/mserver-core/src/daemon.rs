//! Detaching from the terminal and the pidfile

use mserver_common::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{self, Pid};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Detach from the controlling terminal: fork, start a new session, chdir
/// to `/` and point the standard streams at `/dev/null`
pub fn daemonize() -> Result<()> {
    unistd::daemon(false, false).map_err(|e| Error::Daemon(e.to_string()))
}

/// Write the PID of the current process to `path`.
///
/// An existing pidfile naming a live process other than this one is left
/// alone and reported as an error. A stale one is replaced.
pub fn create_pidfile(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::Pidfile(format!(
            "{}: invalid name for a pidfile",
            path.display()
        )));
    }

    let me = unistd::getpid();
    match fs::read_to_string(path) {
        Ok(content) => match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 && pid != me.as_raw() && is_alive(Pid::from_raw(pid)) => {
                return Err(Error::Pidfile(format!(
                    "{}: process {} is still running",
                    path.display(),
                    pid
                )));
            }
            _ => debug!("replacing stale pidfile {}", path.display()),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("cannot read pidfile {}: {}", path.display(), e),
    }

    fs::write(path, format!("{}\n", me))
        .map_err(|e| Error::Pidfile(format!("cannot create pidfile {}: {}", path.display(), e)))
}

fn is_alive(pid: Pid) -> bool {
    // EPERM: the process exists but belongs to somebody else
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn own_pid() -> String {
        format!("{}\n", std::process::id())
    }

    #[test]
    fn test_create_pidfile() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mserver.pid");

        create_pidfile(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), own_pid());

        // Our own PID may be rewritten
        create_pidfile(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), own_pid());
    }

    #[test]
    fn test_relative_pidfile_rejected() {
        let err = create_pidfile(Path::new("run/mserver.pid")).unwrap_err();
        assert!(matches!(err, Error::Pidfile(_)));
        assert_eq!(err.code(), "PIDFILE_ERROR");
    }

    #[test]
    fn test_stale_pidfile_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.pid");
        // PIDs above the kernel maximum (4194304) never exist
        fs::write(&path, "4999999\n").unwrap();

        create_pidfile(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), own_pid());

        fs::write(&path, "garbage").unwrap();
        create_pidfile(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), own_pid());
    }

    #[test]
    fn test_live_pidfile_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.pid");
        // PID 1 is always running
        fs::write(&path, "1\n").unwrap();

        assert!(matches!(create_pidfile(&path), Err(Error::Pidfile(_))));
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n");
    }
}
