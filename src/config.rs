use crate::error::SchedError;
use crate::timer::MIN_PREEMPT_INTERVAL;
use std::env;
use std::time::Duration;

/// Default stack for each task (256KB). Task bodies print, and printing
/// under a panic hook wants more than a bare loop.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack a task may be given.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Run parameters, fixed before the first dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Tick period of the preemption source; `None` runs purely cooperative.
    pub preempt_interval: Option<Duration>,
    pub stack_size: usize,
    /// Seed for task start arguments; `None` derives one from the process.
    pub seed: Option<u64>,
    /// Start arguments are drawn from `[0, arg_bound)`.
    pub arg_bound: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            preempt_interval: None,
            stack_size: DEFAULT_STACK_SIZE,
            seed: None,
            arg_bound: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn with_preempt_interval(mut self, interval: Duration) -> Self {
        self.preempt_interval = Some(interval);
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_arg_bound(mut self, bound: u32) -> Self {
        self.arg_bound = bound;
        self
    }

    /// Defaults overridden by `JMPSCHED_PREEMPT_US`, `JMPSCHED_SEED` and
    /// `JMPSCHED_STACK_SIZE`.
    pub fn from_env() -> Result<Self, SchedError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SchedError> {
        let mut config = SchedulerConfig::default();

        if let Some(us) = lookup("JMPSCHED_PREEMPT_US") {
            let us: u64 = parse("JMPSCHED_PREEMPT_US", &us)?;
            config.preempt_interval = (us > 0).then(|| Duration::from_micros(us));
        }
        if let Some(seed) = lookup("JMPSCHED_SEED") {
            config.seed = Some(parse("JMPSCHED_SEED", &seed)?);
        }
        if let Some(size) = lookup("JMPSCHED_STACK_SIZE") {
            config.stack_size = parse("JMPSCHED_STACK_SIZE", &size)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(SchedError::Config(format!(
                "stack size {} below minimum {MIN_STACK_SIZE}",
                self.stack_size
            )));
        }
        if let Some(interval) = self.preempt_interval {
            if interval < MIN_PREEMPT_INTERVAL {
                return Err(SchedError::Config(format!(
                    "preemption interval {interval:?} below {MIN_PREEMPT_INTERVAL:?}"
                )));
            }
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SchedError> {
    value
        .trim()
        .parse()
        .map_err(|_| SchedError::Config(format!("{key}: cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = SchedulerConfig::from_lookup(lookup(&[
            ("JMPSCHED_PREEMPT_US", "1000"),
            ("JMPSCHED_SEED", "7"),
        ]))
        .unwrap();
        assert_eq!(config.preempt_interval, Some(Duration::from_millis(1)));
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
    }

    #[test]
    fn zero_interval_means_cooperative() {
        let config = SchedulerConfig::from_lookup(lookup(&[("JMPSCHED_PREEMPT_US", "0")])).unwrap();
        assert_eq!(config.preempt_interval, None);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = SchedulerConfig::from_lookup(lookup(&[("JMPSCHED_SEED", "abc")])).unwrap_err();
        assert!(matches!(err, SchedError::Config(_)));

        let err =
            SchedulerConfig::from_lookup(lookup(&[("JMPSCHED_STACK_SIZE", "1024")])).unwrap_err();
        assert!(matches!(err, SchedError::Config(_)));
    }

    #[test]
    fn interval_below_timer_resolution_is_rejected() {
        let config = SchedulerConfig::default().with_preempt_interval(Duration::from_nanos(500));
        assert!(matches!(config.validate(), Err(SchedError::Config(_))));

        let config = SchedulerConfig::default().with_preempt_interval(Duration::from_micros(1));
        assert!(config.validate().is_ok());
    }
}
