//! FIFO of suspended fibers awaiting dispatch.

use crate::error::SchedError;
use std::collections::VecDeque;
use std::fmt;
use std::io;

/// Index of a fiber in the scheduler's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) usize);

impl FiberId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ready queue. Holds arena indices, never contexts, so an entry can't
/// outlive the stack it would resume onto.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: VecDeque<FiberId>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fiber. Fails only when the queue cannot grow.
    pub fn push_back(&mut self, id: FiberId) -> Result<(), SchedError> {
        self.entries
            .try_reserve(1)
            .map_err(|e| SchedError::Allocation(io::Error::new(io::ErrorKind::OutOfMemory, e)))?;
        self.entries.push_back(id);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<FiberId> {
        self.entries.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
