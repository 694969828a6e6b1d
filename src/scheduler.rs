//! Round-robin dispatcher.
//!
//! One `Scheduler` multiplexes its registered tasks onto the calling thread.
//! Tasks are entered in registration order and each one parks straight away,
//! before its body runs, so every task is started before any body can hold
//! the CPU. After that the dispatcher only pops the ready queue, so tasks run
//! in exactly the order they gave up the CPU. A task gives it up by calling [`yield_now`],
//! by hitting a [`preempt_point`] while a timer tick is pending, or by
//! returning.

use crate::config::SchedulerConfig;
use crate::context::ExecutionContext;
use crate::error::SchedError;
use crate::fiber::{self, Exit, Fiber};
use crate::guard::{CriticalSection, PreemptGuard};
use crate::queue::{FiberId, ReadyQueue};
use crate::rng::XorShift64;
use crate::timer::{SignalTimer, TickSource};
use std::cell::Cell;
use std::ptr;

/// Start argument handed to a task on its first entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskArg {
    /// Registration index of the task.
    pub index: usize,
    /// Pseudo-random value in `[0, arg_bound)`.
    pub n: u32,
}

pub type TaskEntry = Box<dyn FnOnce(TaskArg) + 'static>;

/// A registered task that has not been started yet.
pub struct TaskDescriptor {
    name: String,
    entry: TaskEntry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedState {
    NotStarted,
    /// Entering task `i`; it parks before its body runs.
    Running(usize),
    /// Inside a fiber resumed from the ready queue.
    Dispatching,
    /// Every task started; pulling from the ready queue.
    Draining,
    Done,
}

/// Counters for a finished run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub started: usize,
    pub completed: usize,
    pub dispatches: u64,
    pub cooperative_yields: u64,
    pub forced_yields: u64,
    /// Ticks thrown away because a critical section was open.
    pub dropped_ticks: u64,
}

/// State reachable from inside tasks.
struct Core {
    guard: PreemptGuard,
    ticks: Box<dyn TickSource>,
    dropped_ticks: Cell<u64>,
    /// Tasks entered so far.
    started: Cell<usize>,
}

thread_local! {
    static CURRENT: Cell<*const Core> = const { Cell::new(ptr::null()) };
}

fn with_core<R>(f: impl FnOnce(&Core) -> R) -> Option<R> {
    let core = CURRENT.with(|c| c.get());
    if core.is_null() {
        return None;
    }
    Some(f(unsafe { &*core }))
}

/// Publishes a scheduler's core to its tasks for the length of a run.
struct Registration;

impl Registration {
    fn install(core: &Core) -> Result<Self, SchedError> {
        CURRENT.with(|c| {
            if !c.get().is_null() {
                return Err(SchedError::Reentrant);
            }
            c.set(core);
            Ok(Registration)
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(ptr::null()));
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    tasks: Vec<Option<TaskDescriptor>>,
    next_task: usize,
    fibers: Vec<Option<Fiber>>,
    ready: ReadyQueue,
    /// Where the dispatcher parks while a fiber runs.
    dispatcher: ExecutionContext,
    state: SchedState,
    rng: XorShift64,
    core: Box<Core>,
    stats: RunStats,
}

impl Scheduler {
    /// Scheduler whose preemption ticks come from SIGALRM.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedError> {
        Self::with_ticks(config, SignalTimer::new())
    }

    pub fn with_ticks(
        config: SchedulerConfig,
        ticks: impl TickSource + 'static,
    ) -> Result<Self, SchedError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => XorShift64::new(seed),
            None => XorShift64::from_process(),
        };

        Ok(Scheduler {
            config,
            tasks: Vec::new(),
            next_task: 0,
            fibers: Vec::new(),
            ready: ReadyQueue::new(),
            dispatcher: ExecutionContext::default(),
            state: SchedState::NotStarted,
            rng,
            core: Box::new(Core {
                guard: PreemptGuard::new(),
                ticks: Box::new(ticks),
                dropped_ticks: Cell::new(0),
                started: Cell::new(0),
            }),
            stats: RunStats::default(),
        })
    }

    /// Add a task. The set is frozen once `run` starts.
    pub fn register<F>(&mut self, name: impl Into<String>, entry: F) -> Result<(), SchedError>
    where
        F: FnOnce(TaskArg) + 'static,
    {
        if self.state != SchedState::NotStarted {
            return Err(SchedError::AlreadyStarted);
        }
        self.tasks.push(Some(TaskDescriptor {
            name: name.into(),
            entry: Box::new(entry),
        }));
        Ok(())
    }

    pub fn state(&self) -> SchedState {
        self.state
    }

    /// Run every registered task to completion.
    pub fn run(&mut self) -> Result<RunStats, SchedError> {
        if self.state != SchedState::NotStarted {
            return Err(SchedError::AlreadyStarted);
        }
        let registration = Registration::install(&self.core)?;
        log::info!("scheduler starting {} task(s)", self.tasks.len());

        if let Some(interval) = self.config.preempt_interval {
            self.core.guard.enter();
            let armed = self.core.ticks.arm(interval);
            self.core.guard.exit();
            armed?;
        }

        let result = self.dispatch_all();

        self.core.ticks.disarm();
        drop(registration);
        self.stats.dropped_ticks = self.core.dropped_ticks.get();
        self.stats.started = self.core.started.get();

        match result {
            Ok(()) => {
                self.set_state(SchedState::Done);
                log::info!(
                    "scheduler done: {} completed, {} dispatches, {} forced yields",
                    self.stats.completed,
                    self.stats.dispatches,
                    self.stats.forced_yields
                );
                Ok(self.stats.clone())
            }
            Err(e) => {
                log::error!("scheduler aborted: {e}");
                Err(e)
            }
        }
    }

    fn dispatch_all(&mut self) -> Result<(), SchedError> {
        while self.next_task < self.tasks.len() {
            let index = self.next_task;
            self.next_task += 1;
            self.set_state(SchedState::Running(index));

            let Some(task) = self.tasks[index].take() else {
                continue;
            };
            let arg = TaskArg {
                index,
                n: self.rng.below(self.config.arg_bound),
            };
            let id = self.spawn(task, arg)?;
            self.core.started.set(self.core.started.get() + 1);
            self.dispatch(id)?;
        }

        self.set_state(SchedState::Draining);
        while let Some(id) = self.ready.pop_front() {
            self.set_state(SchedState::Dispatching);
            self.dispatch(id)?;
            self.set_state(SchedState::Draining);
        }

        let suspended = self.fibers.iter().flatten().count();
        if suspended > 0 {
            return Err(SchedError::QueueUnderflow { suspended });
        }
        Ok(())
    }

    fn spawn(&mut self, task: TaskDescriptor, arg: TaskArg) -> Result<FiberId, SchedError> {
        let id = FiberId(self.fibers.len());
        let TaskDescriptor { name, entry } = task;
        log::debug!("starting task '{name}' as fiber {id} with n = {}", arg.n);

        // The first entry only parks the fiber, so entering a task never runs
        // any of its body and every task is started before any body runs.
        let body = Box::new(move || {
            fiber::suspend(Exit::Started);
            entry(arg)
        });
        let fiber = Fiber::new(id, name, body, self.config.stack_size)?;
        self.fibers.push(Some(fiber));
        Ok(id)
    }

    fn dispatch(&mut self, id: FiberId) -> Result<(), SchedError> {
        let fiber = self
            .fibers
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| SchedError::InvalidResume {
                task: id.to_string(),
            })?;

        // every dispatch starts a fresh slice
        self.core.ticks.take_tick();
        self.stats.dispatches += 1;
        log::trace!("switch to fiber {id} ({})", fiber.name());

        match fiber.resume(&mut self.dispatcher)? {
            Exit::Started => {
                self.ready.push_back(id)?;
            }
            Exit::Yielded => {
                self.stats.cooperative_yields += 1;
                self.ready.push_back(id)?;
            }
            Exit::Preempted => {
                self.stats.forced_yields += 1;
                log::trace!("fiber {id} preempted");
                self.ready.push_back(id)?;
            }
            Exit::Completed => {
                self.stats.completed += 1;
                log::debug!("task '{}' complete", fiber.name());
                self.fibers[id.index()] = None;
            }
            Exit::Panicked => {
                let task = fiber.name().to_string();
                self.fibers[id.index()] = None;
                return Err(SchedError::TaskPanicked { task });
            }
        }
        Ok(())
    }

    fn set_state(&mut self, state: SchedState) {
        if self.state != state {
            log::trace!("scheduler {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.core.ticks.disarm();
    }
}

// ============================================================================
// Task-facing API
// ============================================================================

/// Give up the CPU; the task continues after everything queued before it.
///
/// Does nothing outside a task.
pub fn yield_now() {
    if with_core(|_| ()).is_some() {
        fiber::suspend(Exit::Yielded);
    }
}

/// Safe point for preemption.
///
/// If a tick is pending and no critical section is open, the task is
/// requeued exactly as if it had called [`yield_now`]. A tick that finds the
/// guard held is dropped.
pub fn preempt_point() {
    let preempt = with_core(|core| {
        if !core.ticks.take_tick() {
            return false;
        }
        if core.guard.is_guarded() {
            core.dropped_ticks.set(core.dropped_ticks.get() + 1);
            return false;
        }
        true
    });
    if preempt == Some(true) {
        fiber::suspend(Exit::Preempted);
    }
}

/// Open a critical section: no forced yield happens until it is dropped.
///
/// Sections nest. Cooperative yields are still allowed inside one.
pub fn critical_section() -> CriticalSection {
    let active = with_core(|core| core.guard.enter()).is_some();
    CriticalSection { active }
}

pub(crate) fn leave_critical() {
    with_core(|core| {
        if core.guard.exit() && core.ticks.take_tick() {
            // arrived while guarded
            core.dropped_ticks.set(core.dropped_ticks.get() + 1);
        }
    });
}

/// Nesting depth of the running scheduler's guard, 0 outside a run.
pub fn critical_depth() -> u32 {
    with_core(|core| core.guard.depth()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTicks;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    fn cooperative() -> SchedulerConfig {
        SchedulerConfig::default().with_seed(1)
    }

    #[test]
    fn empty_scheduler_finishes() {
        let mut sched = Scheduler::with_ticks(cooperative(), ManualTicks::new()).unwrap();
        let stats = sched.run().unwrap();
        assert_eq!(stats, RunStats::default());
        assert_eq!(sched.state(), SchedState::Done);
    }

    #[test]
    fn tasks_start_in_registration_order() {
        let log: Log = Rc::default();
        let mut sched = Scheduler::with_ticks(cooperative(), ManualTicks::new()).unwrap();
        for name in ["a", "b", "c"] {
            let log = log.clone();
            sched
                .register(name, move |arg| {
                    log.borrow_mut().push(format!("{name} start {}", arg.index));
                    yield_now();
                    log.borrow_mut().push(format!("{name} end"));
                })
                .unwrap();
        }

        let stats = sched.run().unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["a start 0", "b start 1", "c start 2", "a end", "b end", "c end"]
        );
        assert_eq!(stats.started, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.cooperative_yields, 3);
        // one entry, one body slice and one resume per task
        assert_eq!(stats.dispatches, 9);
    }

    #[test]
    fn start_arguments_are_bounded_and_seeded() {
        let args = Rc::new(RefCell::new(Vec::new()));
        let run = |args: Rc<RefCell<Vec<u32>>>| {
            let config = cooperative().with_arg_bound(5);
            let mut sched = Scheduler::with_ticks(config, ManualTicks::new()).unwrap();
            for i in 0..8 {
                let args = args.clone();
                sched
                    .register(format!("t{i}"), move |arg| args.borrow_mut().push(arg.n))
                    .unwrap();
            }
            sched.run().unwrap();
        };
        run(args.clone());
        let first = args.replace(Vec::new());
        run(args.clone());
        assert_eq!(first, *args.borrow());
        assert!(first.iter().all(|&n| n < 5));
    }

    #[test]
    fn register_after_run_is_rejected() {
        let mut sched = Scheduler::with_ticks(cooperative(), ManualTicks::new()).unwrap();
        sched.run().unwrap();
        assert!(matches!(
            sched.register("late", |_| {}),
            Err(SchedError::AlreadyStarted)
        ));
        assert!(matches!(sched.run(), Err(SchedError::AlreadyStarted)));
    }

    #[test]
    fn nested_run_is_rejected() {
        let nested = Rc::new(Cell::new(false));
        let seen = nested.clone();
        let mut sched = Scheduler::with_ticks(cooperative(), ManualTicks::new()).unwrap();
        sched
            .register("outer", move |_| {
                let mut inner = Scheduler::with_ticks(cooperative(), ManualTicks::new()).unwrap();
                seen.set(matches!(inner.run(), Err(SchedError::Reentrant)));
            })
            .unwrap();
        sched.run().unwrap();
        assert!(nested.get());
    }

    #[test]
    fn panicking_task_aborts_the_run() {
        let mut sched = Scheduler::with_ticks(cooperative(), ManualTicks::new()).unwrap();
        sched.register("ok", |_| yield_now()).unwrap();
        sched.register("bad", |_| panic!("task failure")).unwrap();
        match sched.run() {
            Err(SchedError::TaskPanicked { task }) => assert_eq!(task, "bad"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn pending_tick_forces_a_yield_at_the_next_safe_point() {
        let ticks = ManualTicks::new();
        let config = cooperative().with_preempt_interval(std::time::Duration::from_millis(1));
        let mut sched = Scheduler::with_ticks(config, ticks.clone()).unwrap();
        let log: Log = Rc::default();

        let (l, t) = (log.clone(), ticks.clone());
        sched
            .register("spinner", move |_| {
                l.borrow_mut().push("spin 0".into());
                t.fire();
                preempt_point();
                l.borrow_mut().push("spin 1".into());
            })
            .unwrap();
        let l = log.clone();
        sched
            .register("other", move |_| l.borrow_mut().push("other".into()))
            .unwrap();

        let stats = sched.run().unwrap();
        assert_eq!(*log.borrow(), vec!["spin 0", "other", "spin 1"]);
        assert_eq!(stats.forced_yields, 1);
        assert_eq!(stats.cooperative_yields, 0);
        assert!(!ticks.is_armed());
    }

    #[test]
    fn guarded_ticks_are_dropped() {
        let ticks = ManualTicks::new();
        let config = cooperative().with_preempt_interval(std::time::Duration::from_millis(1));
        let mut sched = Scheduler::with_ticks(config, ticks.clone()).unwrap();
        let depth = Rc::new(Cell::new(0));

        let (t, d) = (ticks.clone(), depth.clone());
        sched
            .register("guarded", move |_| {
                let outer = critical_section();
                let inner = critical_section();
                d.set(critical_depth());
                t.fire();
                preempt_point();
                drop(inner);
                t.fire();
                preempt_point();
                drop(outer);
                // nothing pending survives the section
                preempt_point();
            })
            .unwrap();

        let stats = sched.run().unwrap();
        assert_eq!(depth.get(), 2);
        assert_eq!(stats.forced_yields, 0);
        assert_eq!(stats.dropped_ticks, 2);
    }

    #[test]
    fn tick_landing_after_section_closes_preempts() {
        let ticks = ManualTicks::new();
        let config = cooperative().with_preempt_interval(std::time::Duration::from_millis(1));
        let mut sched = Scheduler::with_ticks(config, ticks.clone()).unwrap();

        let t = ticks.clone();
        sched
            .register("task", move |_| {
                {
                    let _section = critical_section();
                    t.fire();
                }
                t.fire();
                preempt_point();
            })
            .unwrap();

        let stats = sched.run().unwrap();
        assert_eq!(stats.dropped_ticks, 1);
        assert_eq!(stats.forced_yields, 1);
    }

    #[test]
    fn every_task_is_entered_before_a_busy_body_runs() {
        let seen_started = Rc::new(Cell::new(0));
        let order: Log = Rc::default();
        let mut sched = Scheduler::with_ticks(cooperative(), ManualTicks::new()).unwrap();

        let (seen, o) = (seen_started.clone(), order.clone());
        sched
            .register("busy", move |_| {
                // never yields and has no safe point
                seen.set(with_core(|core| core.started.get()).unwrap_or(0));
                o.borrow_mut().push("busy".into());
            })
            .unwrap();
        for name in ["b", "c"] {
            let o = order.clone();
            sched
                .register(name, move |_| o.borrow_mut().push(name.into()))
                .unwrap();
        }

        let stats = sched.run().unwrap();
        assert_eq!(seen_started.get(), 3);
        assert_eq!(*order.borrow(), vec!["busy", "b", "c"]);
        assert_eq!(stats.started, 3);
        assert_eq!(stats.cooperative_yields, 0);
    }

    #[test]
    fn sub_microsecond_preemption_is_rejected_up_front() {
        let config = cooperative().with_preempt_interval(std::time::Duration::from_nanos(500));
        assert!(matches!(
            Scheduler::with_ticks(config, ManualTicks::new()),
            Err(SchedError::Config(_))
        ));
    }

    #[test]
    fn api_is_inert_outside_a_run() {
        yield_now();
        preempt_point();
        let section = critical_section();
        assert_eq!(critical_depth(), 0);
        drop(section);
    }
}
