//! Clocks for the send loop
//!
//! The scheduler never reads a clock itself; callers pass a [`Timestamp`]
//! taken from whichever [`TimeSource`] fits. The lesson binaries use tokio's
//! clock so paused-time tests apply; [`FixedTime`] is moved by hand.

/// Milliseconds since an arbitrary, fixed origin
pub type Timestamp = u64;

/// Anything that can say what time it is
pub trait TimeSource {
    /// Current time in milliseconds
    fn now(&self) -> Timestamp;
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct FixedTime {
    timestamp: Timestamp,
}

impl FixedTime {
    /// Start at the given timestamp
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    /// Jump to a timestamp
    pub fn set(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }

    /// Move forward by `ms` milliseconds
    pub fn advance(&mut self, ms: u64) {
        self.timestamp = self.timestamp.saturating_add(ms);
    }
}

impl TimeSource for FixedTime {
    fn now(&self) -> Timestamp {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_time_advances() {
        let mut time = FixedTime::new(1000);
        assert_eq!(time.now(), 1000);

        time.advance(500);
        assert_eq!(time.now(), 1500);

        time.set(10);
        assert_eq!(time.now(), 10);
    }

    #[test]
    fn fixed_time_saturates() {
        let mut time = FixedTime::new(u64::MAX - 1);
        time.advance(10);
        assert_eq!(time.now(), u64::MAX);
    }
}
