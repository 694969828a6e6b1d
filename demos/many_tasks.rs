//! Many short tasks, each with a stack of its own.

use jmpsched::{Scheduler, SchedulerConfig, logging, yield_now};
use std::time::Instant;

fn main() -> Result<(), jmpsched::SchedError> {
    logging::init_from_env();

    let start = Instant::now();
    let task_count = 2_000;
    let config = SchedulerConfig::default().with_stack_size(32 * 1024);

    let mut sched = Scheduler::new(config)?;
    for i in 0..task_count {
        sched.register(format!("task{i}"), move |arg| {
            for _ in 0..arg.n {
                yield_now();
            }
        })?;
    }

    println!(
        "[{:>8.3}s] Registered {task_count} tasks, starting scheduler...",
        start.elapsed().as_secs_f64()
    );
    let stats = sched.run()?;
    println!(
        "[{:>8.3}s] Done! {} tasks completed in {} dispatches.",
        start.elapsed().as_secs_f64(),
        stats.completed,
        stats.dispatches
    );
    Ok(())
}
