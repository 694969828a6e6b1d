//! Critical-section guard.
//!
//! A nesting counter that forced yields consult before firing. It does not
//! mask the timer signal; ticks that land while the counter is non-zero are
//! dropped when the section closes.

use std::cell::Cell;

#[derive(Debug, Default)]
pub struct PreemptGuard {
    depth: Cell<u32>,
}

impl PreemptGuard {
    pub const fn new() -> Self {
        PreemptGuard {
            depth: Cell::new(0),
        }
    }

    pub fn enter(&self) {
        self.depth.set(self.depth.get() + 1);
    }

    /// Leave one nesting level. Returns `true` when the guard became clear.
    pub fn exit(&self) -> bool {
        let depth = self.depth.get();
        debug_assert!(depth > 0, "critical section exit without enter");
        let depth = depth.saturating_sub(1);
        self.depth.set(depth);
        depth == 0
    }

    pub fn is_guarded(&self) -> bool {
        self.depth.get() > 0
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }
}

/// Open critical section on the running scheduler; closes on drop.
///
/// Obtained from [`crate::critical_section`]. Outside a scheduler run it is
/// inert.
#[must_use = "the section closes as soon as this is dropped"]
pub struct CriticalSection {
    pub(crate) active: bool,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if self.active {
            crate::scheduler::leave_critical();
        }
    }
}

/// `println!` that cannot be preempted halfway through.
#[macro_export]
macro_rules! task_println {
    ($($arg:tt)*) => {{
        let _section = $crate::critical_section();
        println!($($arg)*);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_counts_levels() {
        let guard = PreemptGuard::new();
        assert!(!guard.is_guarded());
        guard.enter();
        guard.enter();
        assert_eq!(guard.depth(), 2);
        assert!(!guard.exit());
        assert!(guard.is_guarded());
        assert!(guard.exit());
        assert!(!guard.is_guarded());
    }

    #[test]
    fn section_outside_scheduler_is_inert() {
        let section = crate::critical_section();
        assert!(!section.active);
        drop(section);
    }
}
