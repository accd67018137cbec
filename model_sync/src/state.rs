use std::fmt;

/// Externally visible lifecycle stage of the engine.
///
/// Reported in `NotReady` errors when an operation runs in the wrong stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, model not registered yet.
    Uninitialized,
    /// Model registered, synchronization calls accepted.
    Ready,
    /// A merge or shutdown failed and took its buffers with it; the engine
    /// rejects everything from here on.
    Faulted,
    /// Shut down cleanly.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Ready => "ready",
            Phase::Faulted => "faulted",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Counters threaded through every synchronization call.
#[derive(Debug)]
pub struct SyncState {
    /// Completed synchronization calls, starting at 0.
    pub iteration: u64,

    /// Slot index the next stage-in writes to.
    pub active: usize,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            iteration: 0,
            active: 0,
        }
    }

    #[inline]
    pub fn inc_iteration(&mut self) {
        self.iteration += 1;
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}
