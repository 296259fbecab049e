//! Process pool - table of outstanding worker processes

use mserver_common::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, error};

/// Fixed-capacity table of worker PIDs.
///
/// A capacity of 0 means "no limit": the table then grows on demand.
/// The live count always equals the number of occupied slots.
#[derive(Debug, Default)]
pub struct ProcessPool {
    slots: Vec<Option<Pid>>,
    capacity: usize,
    count: usize,
}

impl ProcessPool {
    /// Create a pool holding at most `capacity` workers (0 = unbounded)
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            capacity,
            count: 0,
        }
    }

    /// Change the ceiling. Only valid while the pool is empty.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        if self.count != 0 {
            return Err(Error::Internal(format!(
                "cannot resize process table with {} live workers",
                self.count
            )));
        }
        *self = Self::new(capacity);
        Ok(())
    }

    /// Configured ceiling (0 = unbounded)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live workers
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether another worker would exceed `capacity`
    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.count >= self.capacity
    }

    /// Live worker PIDs, in slot order
    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.slots.iter().filter_map(|slot| *slot)
    }

    /// Record a freshly spawned worker in the first free slot.
    ///
    /// Admission checks the ceiling before spawning, so a full table here
    /// means the bookkeeping is broken.
    pub fn register(&mut self, pid: Pid) -> Result<()> {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(pid);
        } else if self.capacity == 0 {
            self.slots.push(Some(pid));
        } else {
            error!(
                "cannot find free PID slot for process {} (internal error?)",
                pid
            );
            return Err(Error::Internal("process table full".to_string()));
        }
        self.count += 1;
        Ok(())
    }

    /// Forget a reaped worker. Returns false if `pid` is not ours.
    pub fn unregister(&mut self, pid: Pid) -> bool {
        match self.slots.iter_mut().find(|slot| **slot == Some(pid)) {
            Some(slot) => {
                *slot = None;
                self.count -= 1;
                true
            }
            None => false,
        }
    }

    /// Send SIGTERM to every live worker. Used at final shutdown only.
    pub fn terminate_all(&self) {
        for pid in self.pids() {
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                debug!("kill {}: {}", pid, e);
            }
        }
    }
}
