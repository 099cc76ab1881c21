use std::time::Duration;

/// Restart delays used after consecutive failures of a device server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    steps: Vec<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
        }
    }
}

impl Backoff {
    /// Build a schedule from `steps`, which are sorted so delays never shrink.
    ///
    /// Returns `None` for an empty schedule.
    pub fn new(mut steps: Vec<Duration>) -> Option<Self> {
        if steps.is_empty() {
            return None;
        }
        steps.sort();
        Some(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// A retry counter that never points past the last step.
    pub fn counter(&self) -> RetryCounter {
        RetryCounter {
            value: 0,
            max: self.steps.len() - 1,
        }
    }

    pub fn delay(&self, counter: &RetryCounter) -> Duration {
        self.steps[counter.value.min(self.steps.len() - 1)]
    }
}

/// Saturating index into a [`Backoff`] schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounter {
    value: usize,
    max: usize,
}

impl RetryCounter {
    pub fn value(&self) -> usize {
        self.value
    }

    /// Advance after a failure, clamping at the last step.
    pub fn advance(&mut self) {
        self.value = (self.value + 1).min(self.max);
    }

    /// Go back to the first step after a clean run.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}
