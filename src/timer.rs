//! Preemption tick sources.
//!
//! A tick source only raises a flag. The scheduler polls it at safe points
//! (`preempt_point`) and turns a pending tick into a forced yield there, so
//! nothing ever runs inside the signal handler except an atomic increment.

use crate::error::SchedError;
use std::cell::Cell;
use std::io;
use std::mem;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Finest period `setitimer` can express; anything shorter truncates to a
/// zero timeval, which disarms the timer.
pub const MIN_PREEMPT_INTERVAL: Duration = Duration::from_micros(1);

pub trait TickSource {
    /// Start delivering ticks every `interval`.
    fn arm(&mut self, interval: Duration) -> Result<(), SchedError>;

    /// Stop delivering ticks. Idempotent.
    fn disarm(&mut self);

    /// Consume all pending ticks; `true` if there was at least one.
    fn take_tick(&self) -> bool;
}

// ============================================================================
// SIGALRM interval timer
// ============================================================================

static PENDING_TICKS: AtomicU64 = AtomicU64::new(0);
static SIGNAL_TIMER_ARMED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigalrm(_signo: libc::c_int) {
    PENDING_TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Process-wide `ITIMER_REAL` timer delivering SIGALRM.
///
/// There is one real-time interval timer per process, so at most one
/// `SignalTimer` can be armed at a time.
pub struct SignalTimer {
    previous: Option<libc::sigaction>,
}

impl SignalTimer {
    pub fn new() -> Self {
        SignalTimer { previous: None }
    }

    pub fn is_armed(&self) -> bool {
        self.previous.is_some()
    }
}

impl Default for SignalTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn timeval(d: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs() as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    }
}

fn set_interval(interval: Duration) -> io::Result<()> {
    let spec = libc::itimerval {
        it_interval: timeval(interval),
        it_value: timeval(interval),
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &spec, ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl TickSource for SignalTimer {
    fn arm(&mut self, interval: Duration) -> Result<(), SchedError> {
        if interval < MIN_PREEMPT_INTERVAL {
            return Err(SchedError::Config(format!(
                "preemption interval {interval:?} below {MIN_PREEMPT_INTERVAL:?}"
            )));
        }
        if self.is_armed() {
            set_interval(interval).map_err(SchedError::Timer)?;
            return Ok(());
        }
        if SIGNAL_TIMER_ARMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedError::TimerBusy);
        }

        let mut previous: libc::sigaction = unsafe { mem::zeroed() };
        let rc = unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = on_sigalrm as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGALRM, &action, &mut previous)
        };
        if rc != 0 {
            SIGNAL_TIMER_ARMED.store(false, Ordering::Release);
            return Err(SchedError::Timer(io::Error::last_os_error()));
        }
        self.previous = Some(previous);
        PENDING_TICKS.store(0, Ordering::Relaxed);

        if let Err(e) = set_interval(interval) {
            self.disarm();
            return Err(SchedError::Timer(e));
        }
        log::debug!("signal timer armed every {interval:?}");
        Ok(())
    }

    fn disarm(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        if let Err(e) = set_interval(Duration::ZERO) {
            log::warn!("failed to cancel interval timer: {e}");
        }
        // A tick generated just before the cancel can still be pending. Under
        // SIG_DFL it would kill the process, so our handler stays in that case.
        if previous.sa_sigaction != libc::SIG_DFL {
            let rc = unsafe { libc::sigaction(libc::SIGALRM, &previous, ptr::null_mut()) };
            if rc != 0 {
                log::warn!(
                    "failed to restore SIGALRM disposition: {}",
                    io::Error::last_os_error()
                );
            }
        }
        PENDING_TICKS.store(0, Ordering::Relaxed);
        SIGNAL_TIMER_ARMED.store(false, Ordering::Release);
        log::debug!("signal timer disarmed");
    }

    fn take_tick(&self) -> bool {
        self.is_armed() && PENDING_TICKS.swap(0, Ordering::Relaxed) > 0
    }
}

impl Drop for SignalTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

// ============================================================================
// Manually fired ticks
// ============================================================================

/// Tick source driven by hand, for deterministic preemption.
///
/// Clones share the same pending counter, so a task body can hold one clone
/// and fire ticks at exact points while the scheduler polls another.
#[derive(Clone, Debug, Default)]
pub struct ManualTicks {
    pending: Rc<Cell<u32>>,
    armed: Rc<Cell<bool>>,
}

impl ManualTicks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make one tick pending. Ticks fired while disarmed are lost.
    pub fn fire(&self) {
        if self.armed.get() {
            self.pending.set(self.pending.get() + 1);
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending.get()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.get()
    }
}

impl TickSource for ManualTicks {
    fn arm(&mut self, _interval: Duration) -> Result<(), SchedError> {
        self.armed.set(true);
        Ok(())
    }

    fn disarm(&mut self) {
        self.armed.set(false);
        self.pending.set(0);
    }

    fn take_tick(&self) -> bool {
        self.pending.replace(0) > 0
    }
}
