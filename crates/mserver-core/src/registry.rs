//! Process-wide supervisor registry and child reaping
//!
//! A signal handler cannot know which supervisor spawned the child that
//! exited, so every live supervisor registers its worker table here and the
//! idle hook walks the list for each reaped PID.

use crate::exit::ExitTranslator;
use crate::pool::ProcessPool;
use crate::signals;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Identifier of a registered supervisor
pub type SupervisorId = u64;

/// Worker bookkeeping of one supervisor
#[derive(Debug)]
pub(crate) struct WorkerTable {
    pub ident: Option<String>,
    pub pool: ProcessPool,
    pub strexit: Option<ExitTranslator>,
}

pub(crate) type SharedTable = Arc<Mutex<WorkerTable>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static REGISTRY: Mutex<Vec<(SupervisorId, SharedTable)>> = Mutex::new(Vec::new());

/// Lock ignoring poison: the tables hold plain data that stays consistent
/// across a panicking holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn register(table: SharedTable) -> SupervisorId {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    lock(&REGISTRY).push((id, table));
    id
}

pub(crate) fn unregister(id: SupervisorId) {
    lock(&REGISTRY).retain(|(entry, _)| *entry != id);
}

#[cfg(test)]
pub(crate) fn is_registered(id: SupervisorId) -> bool {
    lock(&REGISTRY).iter().any(|(entry, _)| *entry == id)
}

/// Number of live supervisors in this process
pub fn supervisor_count() -> usize {
    lock(&REGISTRY).len()
}

/// Idle hook run by the multiplexer between readiness waits.
///
/// Reaps every finished child if a SIGCHLD arrived since the last call and
/// returns the "stop requested" latch; `true` ends the event loop.
pub fn idle_hook() -> bool {
    if signals::take_cleanup() {
        reap_children();
    }
    signals::stop_requested()
}

/// Collect every exited child without blocking. Returns how many were
/// reaped.
pub(crate) fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                reaped += 1;
                route_exit(status);
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                warn!("waitpid: {}", e);
                break;
            }
        }
    }
    reaped
}

/// Hand a reaped child to the supervisor owning it. A PID belongs to at
/// most one pool, so the walk stops at the first match.
pub(crate) fn route_exit(status: WaitStatus) -> Option<SupervisorId> {
    let pid = status.pid()?;
    let entries: Vec<(SupervisorId, SharedTable)> = lock(&REGISTRY).clone();

    for (id, table) in entries {
        let mut guard = lock(&table);
        if guard.pool.unregister(pid) {
            log_exit(&guard, pid, status);
            return Some(id);
        }
    }
    debug!("process {} does not belong to any server", pid);
    None
}

fn log_exit(table: &WorkerTable, pid: Pid, status: WaitStatus) {
    let server = table.ident.as_deref().unwrap_or("mserver");
    match status {
        WaitStatus::Exited(_, code) => {
            let text = match table.strexit {
                Some(strexit) => format!(
                    "process {} finished with code {} ({})",
                    pid,
                    code,
                    strexit(code)
                ),
                None => format!("process {} finished with code {}", pid, code),
            };
            if code == 0 {
                debug!(server, "{}", text);
            } else {
                info!(server, "{}", text);
            }
        }
        WaitStatus::Signaled(_, signal, _) => {
            error!(server, "process {} terminated on signal {}", pid, signal as i32);
        }
        _ => {
            error!(server, "process {} terminated (cause unknown)", pid);
        }
    }
}
