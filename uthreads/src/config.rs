use std::num::NonZeroUsize;
use std::thread::available_parallelism;
use std::time::Duration;

/// Recommended carrier time slice: 10ms, matching the original scheduler's
/// default quantum.
pub const DEFAULT_TIME_SLICE: Duration = Duration::from_millis(10);

/// Runtime tunables for [`crate::init`].
///
/// The only knobs the library exposes: how many kernel-backed carriers
/// multiplex ManyMany threads, and how long each gets before the
/// preemption timer fires.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub n_carriers: NonZeroUsize,
    pub time_slice: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_carriers: available_parallelism().unwrap_or(NonZeroUsize::new(1).unwrap()),
            time_slice: DEFAULT_TIME_SLICE,
        }
    }
}

impl Config {
    /// A config with the default time slice and `n_carriers` carriers.
    pub fn with_carriers(n_carriers: usize) -> Self {
        Self {
            n_carriers: NonZeroUsize::new(n_carriers).unwrap_or(NonZeroUsize::new(1).unwrap()),
            ..Self::default()
        }
    }
}
