use std::fmt;
use std::io;

/// Every way a scheduler run can fail.
///
/// None of these are retried: they are either misuse of the API or a broken
/// invariant that would leave a lost context behind.
#[derive(Debug)]
pub enum SchedError {
    /// A fiber was resumed while running or after it finished.
    InvalidResume { task: String },
    /// The ready queue ran dry while suspended fibers were still waiting.
    QueueUnderflow { suspended: usize },
    /// A task stack or a ready-queue slot could not be allocated.
    Allocation(io::Error),
    /// Installing or arming the interval timer failed.
    Timer(io::Error),
    /// Another signal timer is already armed in this process.
    TimerBusy,
    /// A task body panicked; the run was abandoned.
    TaskPanicked { task: String },
    /// Tasks can only be registered before the first dispatch.
    AlreadyStarted,
    /// `run` was called from inside a task.
    Reentrant,
    /// A configuration value was rejected.
    Config(String),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::InvalidResume { task } => {
                write!(f, "task '{task}' resumed from a dead or running context")
            }
            SchedError::QueueUnderflow { suspended } => {
                write!(f, "ready queue empty with {suspended} task(s) still suspended")
            }
            SchedError::Allocation(e) => write!(f, "allocation failed: {e}"),
            SchedError::Timer(e) => write!(f, "preemption timer: {e}"),
            SchedError::TimerBusy => write!(f, "a signal timer is already armed"),
            SchedError::TaskPanicked { task } => write!(f, "task '{task}' panicked"),
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::Reentrant => write!(f, "scheduler run from inside a task"),
            SchedError::Config(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for SchedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SchedError::Allocation(e) | SchedError::Timer(e) => Some(e),
            _ => None,
        }
    }
}
