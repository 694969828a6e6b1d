//! Fibers: a task body running on a stack of its own.
//!
//! A fiber's saved context always points into the stack the fiber owns, so
//! resuming it can never land on a frame that has already unwound. The only
//! misuse left is resuming a fiber that is running or finished, and that is
//! checked.

use crate::context::{self, ExecutionContext};
use crate::error::SchedError;
use crate::queue::FiberId;
use corosensei::stack::{DefaultStack, Stack};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

pub(crate) type Body = Box<dyn FnOnce()>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    /// Never entered.
    Fresh,
    /// Parked at a yield, waiting in the ready queue.
    Suspended,
    Running,
    Finished,
}

/// Why control came back to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    /// Parked on first entry, before the body ran.
    Started,
    Yielded,
    Preempted,
    Completed,
    Panicked,
}

/// Switch targets of the fiber currently on the CPU.
#[derive(Clone, Copy)]
struct Active {
    fiber: *mut ExecutionContext,
    dispatcher: *const ExecutionContext,
    exit: *const Cell<Exit>,
}

thread_local! {
    static ACTIVE: Cell<Option<Active>> = const { Cell::new(None) };
}

pub struct Fiber {
    id: FiberId,
    name: String,
    context: ExecutionContext,
    state: FiberState,
    /// Owned by the fiber until its first entry, then by the entry trampoline.
    body: *mut Body,
    stack: DefaultStack,
}

impl Fiber {
    pub(crate) fn new(
        id: FiberId,
        name: String,
        body: Body,
        stack_size: usize,
    ) -> Result<Self, SchedError> {
        let stack = DefaultStack::new(stack_size).map_err(SchedError::Allocation)?;
        let stack_top = stack.base().get() & !0xF;
        let body = Box::into_raw(Box::new(body));
        let context =
            unsafe { ExecutionContext::for_entry(stack_top, fiber_entry as usize, body as u64) };

        Ok(Fiber {
            id,
            name,
            context,
            state: FiberState::Fresh,
            body,
            stack,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    /// Run the fiber until it yields, is preempted or finishes.
    ///
    /// The dispatcher's own position is captured into `dispatcher`; the fiber
    /// switches back to it.
    pub(crate) fn resume(&mut self, dispatcher: &mut ExecutionContext) -> Result<Exit, SchedError> {
        match self.state {
            FiberState::Fresh => {
                // the trampoline takes the body from here on
                self.body = ptr::null_mut();
            }
            FiberState::Suspended => {}
            FiberState::Running | FiberState::Finished => {
                return Err(SchedError::InvalidResume {
                    task: self.name.clone(),
                });
            }
        }

        let exit = Cell::new(Exit::Completed);
        let fiber_ctx: *mut ExecutionContext = &mut self.context;
        let dispatcher_ctx: *mut ExecutionContext = dispatcher;
        ACTIVE.with(|a| {
            a.set(Some(Active {
                fiber: fiber_ctx,
                dispatcher: dispatcher_ctx,
                exit: &exit,
            }))
        });
        self.state = FiberState::Running;

        unsafe { context::switch(dispatcher_ctx, fiber_ctx) };

        ACTIVE.with(|a| a.set(None));
        let exit = exit.get();
        self.state = match exit {
            Exit::Started | Exit::Yielded | Exit::Preempted => FiberState::Suspended,
            Exit::Completed | Exit::Panicked => FiberState::Finished,
        };
        Ok(exit)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if !self.body.is_null() {
            drop(unsafe { Box::from_raw(self.body) });
        }
        // A suspended fiber's frames are abandoned with its stack, their
        // destructors never run.
        if self.state == FiberState::Suspended {
            log::debug!("dropping suspended fiber {} ({})", self.id, self.name);
        }
    }
}

/// True while executing on a fiber stack.
pub fn in_fiber() -> bool {
    ACTIVE.with(|a| a.get().is_some())
}

/// Hand control back to the dispatcher with `exit` as the reason.
///
/// Returns `false` without switching when called outside a fiber. Otherwise
/// returns `true` once the dispatcher resumes this fiber.
pub(crate) fn suspend(exit: Exit) -> bool {
    let Some(active) = ACTIVE.with(|a| a.get()) else {
        return false;
    };
    unsafe {
        (*active.exit).set(exit);
        context::switch(active.fiber, active.dispatcher);
    }
    true
}

extern "C" fn fiber_entry() -> ! {
    let body = context::entry_arg() as *mut Body;
    let body = unsafe { Box::from_raw(body) };

    let exit = match panic::catch_unwind(AssertUnwindSafe(move || (*body)())) {
        Ok(()) => Exit::Completed,
        Err(_) => Exit::Panicked,
    };

    suspend(exit);
    // a finished fiber is never resumed
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fiber(body: impl FnOnce() + 'static) -> Fiber {
        Fiber::new(FiberId(0), "test".into(), Box::new(body), 64 * 1024).unwrap()
    }

    #[test]
    fn runs_to_completion() {
        let hit = Rc::new(Cell::new(false));
        let seen = hit.clone();
        let mut f = fiber(move || seen.set(true));
        let mut dispatcher = ExecutionContext::default();

        assert_eq!(f.state(), FiberState::Fresh);
        assert_eq!(f.resume(&mut dispatcher).unwrap(), Exit::Completed);
        assert!(hit.get());
        assert_eq!(f.state(), FiberState::Finished);
    }

    #[test]
    fn resumes_after_each_yield() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let mut f = fiber(move || {
            for i in 0..3 {
                sink.borrow_mut().push(i);
                assert!(suspend(Exit::Yielded));
            }
        });
        let mut dispatcher = ExecutionContext::default();

        for expected in 1..=3 {
            assert_eq!(f.resume(&mut dispatcher).unwrap(), Exit::Yielded);
            assert_eq!(log.borrow().len(), expected);
            assert_eq!(f.state(), FiberState::Suspended);
        }
        assert_eq!(f.resume(&mut dispatcher).unwrap(), Exit::Completed);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn finished_fiber_cannot_be_resumed() {
        let mut f = fiber(|| {});
        let mut dispatcher = ExecutionContext::default();
        f.resume(&mut dispatcher).unwrap();
        assert!(matches!(
            f.resume(&mut dispatcher),
            Err(SchedError::InvalidResume { .. })
        ));
    }

    #[test]
    fn panic_is_caught_at_the_fiber_boundary() {
        let mut f = fiber(|| panic!("boom"));
        let mut dispatcher = ExecutionContext::default();
        assert_eq!(f.resume(&mut dispatcher).unwrap(), Exit::Panicked);
        assert!(!in_fiber());
    }

    #[test]
    fn unstarted_fiber_releases_its_body() {
        let token = Rc::new(());
        let held = token.clone();
        let f = fiber(move || drop(held));
        assert_eq!(Rc::strong_count(&token), 2);
        drop(f);
        assert_eq!(Rc::strong_count(&token), 1);
    }

    #[test]
    fn suspend_outside_fiber_is_refused() {
        assert!(!suspend(Exit::Yielded));
    }
}
