//! Two tasks that each yield `n` times, with a 1ms preemption timer armed.
//!
//! `JMPSCHED_LOG=debug cargo run --example jmp_demo` shows the dispatcher.

use jmpsched::{Scheduler, SchedulerConfig, TaskArg, logging, task_println, yield_now};
use std::process::ExitCode;
use std::time::Duration;

fn task(id: usize) -> impl FnOnce(TaskArg) + 'static {
    move |arg| {
        let n = arg.n;
        task_println!("Task {id}: n = {n}");

        for i in 0..n {
            yield_now();
            task_println!("Task {id}: resume {i}");
        }

        yield_now();
        task_println!("Task {id}: complete {n}");
    }
}

fn run() -> Result<(), jmpsched::SchedError> {
    let mut config = SchedulerConfig::from_env()?;
    if config.preempt_interval.is_none() {
        config = config.with_preempt_interval(Duration::from_millis(1));
    }

    let mut sched = Scheduler::new(config)?;
    sched.register("task0", task(0))?;
    sched.register("task1", task(1))?;
    sched.run()?;
    Ok(())
}

fn main() -> ExitCode {
    logging::init_from_env();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("jmp_demo: {e}");
            ExitCode::FAILURE
        }
    }
}
