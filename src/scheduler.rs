//! Cooperative run-function scheduler.
//!
//! Active plugins hand background work to the scheduler; the host drives it
//! from its own loop through [`crate::Context::run_step`]. Nothing here
//! spawns threads or blocks.

use std::collections::BTreeMap;

use crate::plugin::PluginContext;

/// Scheduling hint for a run function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run on the next step, then drop the registration.
    Once,
    /// Run on every step until it reports [`RunStatus::Done`].
    Recurring,
}

/// Value returned by a run function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// More work remains; recurring registrations stay queued.
    Continue,
    /// Nothing left to do; the registration is dropped.
    Done,
}

/// Handle identifying a run-function registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunHandle(u64);

/// Callable registered by a plugin.
pub type RunFunction = Box<dyn FnMut(&PluginContext<'_>) -> RunStatus + Send>;

struct Registration {
    owner: String,
    mode: RunMode,
    func: RunFunction,
}

#[derive(Debug)]
struct InFlight {
    seq: u64,
    owner: String,
    revoked: bool,
}

/// A registration taken out of the queue for execution.
pub(crate) struct Dispatch {
    pub(crate) seq: u64,
    pub(crate) owner: String,
    pub(crate) mode: RunMode,
    pub(crate) func: RunFunction,
}

/// Queue of run functions in registration order.
#[derive(Default)]
pub struct RunScheduler {
    next_seq: u64,
    queue: BTreeMap<u64, Registration>,
    in_flight: Option<InFlight>,
    stepping: bool,
}

impl RunScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a run function owned by `owner`.
    pub fn register(&mut self, owner: &str, mode: RunMode, func: RunFunction) -> RunHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert(
            seq,
            Registration {
                owner: owner.to_string(),
                mode,
                func,
            },
        );
        tracing::debug!("Plugin {} registered run function #{} ({:?})", owner, seq, mode);
        RunHandle(seq)
    }

    /// Remove a single registration.
    pub fn cancel(&mut self, handle: RunHandle) -> bool {
        if self.queue.remove(&handle.0).is_some() {
            return true;
        }
        match self.in_flight {
            Some(ref mut current) if current.seq == handle.0 && !current.revoked => {
                current.revoked = true;
                true
            }
            _ => false,
        }
    }

    /// Remove every registration owned by `owner`, including one currently
    /// executing. Returns the number of registrations removed.
    pub fn revoke(&mut self, owner: &str) -> usize {
        let before = self.queue.len();
        self.queue.retain(|_, reg| reg.owner != owner);
        let mut removed = before - self.queue.len();

        if let Some(ref mut current) = self.in_flight {
            if current.owner == owner && !current.revoked {
                current.revoked = true;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!("Revoked {} run function(s) of {}", removed, owner);
        }
        removed
    }

    /// Number of queued registrations.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued registrations owned by `owner`.
    pub fn owned_by(&self, owner: &str) -> usize {
        self.queue.values().filter(|r| r.owner == owner).count()
    }

    /// Check if a step is running.
    pub fn is_stepping(&self) -> bool {
        self.stepping
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.queue.clear();
        if let Some(ref mut current) = self.in_flight {
            current.revoked = true;
        }
    }

    /// Begin a step, returning the registrations due in it. `None` when a
    /// step is already running.
    pub(crate) fn begin_step(&mut self) -> Option<Vec<u64>> {
        if self.stepping {
            return None;
        }
        self.stepping = true;
        Some(self.queue.keys().copied().collect())
    }

    /// Take a due registration out of the queue for execution.
    pub(crate) fn take(&mut self, seq: u64) -> Option<Dispatch> {
        let reg = self.queue.remove(&seq)?;
        self.in_flight = Some(InFlight {
            seq,
            owner: reg.owner.clone(),
            revoked: false,
        });
        Some(Dispatch {
            seq,
            owner: reg.owner,
            mode: reg.mode,
            func: reg.func,
        })
    }

    /// Return an executed registration. Recurring registrations that want
    /// to continue and were not revoked meanwhile keep their position.
    pub(crate) fn finish(&mut self, dispatch: Dispatch, status: RunStatus) {
        let revoked = self
            .in_flight
            .take()
            .map(|current| current.revoked)
            .unwrap_or(false);

        if revoked || dispatch.mode == RunMode::Once || status == RunStatus::Done {
            return;
        }

        self.queue.insert(
            dispatch.seq,
            Registration {
                owner: dispatch.owner,
                mode: dispatch.mode,
                func: dispatch.func,
            },
        );
    }

    /// End the step; returns whether any registration remains pending.
    pub(crate) fn end_step(&mut self) -> bool {
        self.stepping = false;
        !self.queue.is_empty()
    }
}

impl std::fmt::Debug for RunScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunScheduler")
            .field("pending", &self.queue.len())
            .field("stepping", &self.stepping)
            .finish()
    }
}
