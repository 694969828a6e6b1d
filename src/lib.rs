//! Single-threaded task scheduler built on hand-rolled context switches.
//!
//! Tasks are registered up front and multiplexed onto the calling OS thread.
//! Each task runs on a stack of its own and gives up the CPU either
//! cooperatively ([`yield_now`]) or when a preemption tick is pending at a
//! [`preempt_point`]. Suspended tasks wait in a FIFO ready queue and are
//! resumed strictly in the order they yielded.
//!
//! ```no_run
//! use jmpsched::{Scheduler, SchedulerConfig, task_println, yield_now};
//! use std::time::Duration;
//!
//! let config = SchedulerConfig::default().with_preempt_interval(Duration::from_millis(1));
//! let mut sched = Scheduler::new(config)?;
//! for t in 0..2 {
//!     sched.register(format!("task{t}"), move |arg| {
//!         for i in 0..arg.n {
//!             yield_now();
//!             task_println!("Task {t}: resume {i}");
//!         }
//!     })?;
//! }
//! sched.run()?;
//! # Ok::<(), jmpsched::SchedError>(())
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
pub mod guard;
pub mod logging;
pub mod queue;
pub mod rng;
pub mod scheduler;
pub mod timer;

pub use config::SchedulerConfig;
pub use error::SchedError;
pub use guard::CriticalSection;
pub use scheduler::{
    RunStats, SchedState, Scheduler, TaskArg, critical_depth, critical_section, preempt_point,
    yield_now,
};
pub use timer::{ManualTicks, SignalTimer, TickSource};
