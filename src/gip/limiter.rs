use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::warn;

use super::process::{GroupTerminator, SignalTerminator};

struct LimiterState {
    order: VecDeque<u32>,
    groups: HashMap<u32, i32>,
}

/// Bounds how many long-lived streaming processes run at once. Adding a
/// process beyond the bound terminates the oldest tracked one first, since a
/// player only consumes one stream at a time and its end-of-stream signal is
/// not reliable enough to drive reclamation.
pub struct ProcessLimiter {
    max_active: usize,
    terminator: Box<dyn GroupTerminator>,
    state: Mutex<LimiterState>,
}

impl ProcessLimiter {
    pub fn new(max_active: usize) -> Self {
        Self::with_terminator(max_active, Box::new(SignalTerminator))
    }

    pub(crate) fn with_terminator(max_active: usize, terminator: Box<dyn GroupTerminator>) -> Self {
        ProcessLimiter {
            max_active,
            terminator,
            state: Mutex::new(LimiterState {
                order: VecDeque::new(),
                groups: HashMap::new(),
            }),
        }
    }

    /// Tracks a newly started streaming process, evicting oldest-first once
    /// the bound is exceeded. Eviction is best-effort; a process that cannot
    /// be terminated is logged and forgotten.
    pub fn add_process(&self, pid: u32, pgid: i32) {
        let evicted = {
            let mut state = self.lock_state();
            state.order.push_back(pid);
            state.groups.insert(pid, pgid);
            let mut evicted = Vec::new();
            while state.order.len() > self.max_active {
                if let Some(oldest) = state.order.pop_front()
                    && let Some(group) = state.groups.remove(&oldest)
                {
                    evicted.push((oldest, group));
                }
            }
            evicted
        };
        for (pid, pgid) in evicted {
            self.terminate(pid, pgid);
        }
    }

    /// Terminates every tracked process and clears the limiter.
    pub fn close(&self) {
        let drained: Vec<(u32, i32)> = {
            let mut state = self.lock_state();
            state.order.clear();
            state.groups.drain().collect()
        };
        for (pid, pgid) in drained {
            self.terminate(pid, pgid);
        }
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        self.lock_state().order.len()
    }

    #[cfg(test)]
    pub(crate) fn tracks(&self, pid: u32) -> bool {
        self.lock_state().groups.contains_key(&pid)
    }

    fn terminate(&self, pid: u32, pgid: i32) {
        if let Err(err) = self.terminator.terminate(pgid) {
            warn!(pid, pgid, "failed to terminate streaming process: {err}");
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ProcessLimiter {
    fn drop(&mut self) {
        self.close();
    }
}
