//! CPU-bound tasks that never yield on their own. Only timer ticks observed
//! at `preempt_point` interleave them.

use jmpsched::{Scheduler, SchedulerConfig, logging, preempt_point, task_println};
use std::hint::black_box;
use std::time::{Duration, Instant};

/// Sum of squares with a safe point on every back-edge.
fn cpu_work(n: u64) -> u64 {
    let mut sum = 0u64;
    for i in 0..n {
        sum = sum.wrapping_add(black_box(i).wrapping_mul(black_box(i)));
        if i % 1024 == 0 {
            preempt_point();
        }
    }
    sum
}

fn main() -> Result<(), jmpsched::SchedError> {
    logging::init_from_env();

    let work_size = 20_000_000u64;
    let num_tasks = 4;
    let config = SchedulerConfig::default().with_preempt_interval(Duration::from_millis(2));

    println!("Running {num_tasks} tasks with work_size = {work_size}");
    let start = Instant::now();

    let mut sched = Scheduler::new(config)?;
    for t in 0..num_tasks {
        sched.register(format!("spin{t}"), move |_| {
            let result = cpu_work(work_size);
            task_println!("Task {t}: result = {result}");
        })?;
    }
    let stats = sched.run()?;

    println!();
    println!("Elapsed: {:?}", start.elapsed());
    println!(
        "Forced yields: {}, dropped ticks: {}, dispatches: {}",
        stats.forced_yields, stats.dropped_ticks, stats.dispatches
    );
    Ok(())
}
