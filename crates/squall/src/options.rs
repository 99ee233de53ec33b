//! Run-loop configuration.

use std::time::Duration;

/// Options for [`Dispatcher::run`](crate::Dispatcher::run).
///
/// The default runs until stopped or until nothing is armed, blocking as
/// long as needed in each wait. A loop bounded by both `timeout` and
/// `max_iterations` keeps turning while idle unless `run_until_idle` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Upper bound on blocking per platform wait. `None` blocks until the
    /// next event or timer deadline.
    pub timeout: Option<Duration>,
    /// Upper bound on loop iterations.
    pub max_iterations: Option<usize>,
    /// Return once no armed watchers remain and nothing is pending, even
    /// when the loop is bounded.
    pub run_until_idle: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run until no armed watchers remain.
    pub fn until_idle() -> Self {
        RunOptions {
            run_until_idle: true,
            ..Self::default()
        }
    }

    /// Run at most `n` iterations.
    pub fn iterations(n: usize) -> Self {
        RunOptions {
            max_iterations: Some(n),
            ..Self::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn run_until_idle(mut self, yes: bool) -> Self {
        self.run_until_idle = yes;
        self
    }
}

/// Why [`Dispatcher::run`](crate::Dispatcher::run) returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No armed watchers and no pending actions remained.
    Idle,
    /// The iteration budget was used up.
    IterationsExhausted,
    /// [`Dispatcher::stop`](crate::Dispatcher::stop) was called.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_compose() {
        let opts = RunOptions::until_idle()
            .timeout(Duration::from_millis(5))
            .max_iterations(3);
        assert!(opts.run_until_idle);
        assert_eq!(opts.timeout, Some(Duration::from_millis(5)));
        assert_eq!(opts.max_iterations, Some(3));
        assert_eq!(RunOptions::iterations(1).max_iterations, Some(1));
        assert_eq!(RunOptions::new(), RunOptions::default());
    }
}
