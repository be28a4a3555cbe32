use crate::error::{RatchetError, Result};
use std::time::{Duration, Instant};

/// Offsets, from statement start, during which execution is arrested and checkpointed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuspendWindow {
    start: Duration,
    end: Duration,
}

impl SuspendWindow {
    pub fn new(start_secs: f64, end_secs: f64) -> Result<Self> {
        let invalid = |reason: &str| RatchetError::SuspendWindowInvalid {
            start: start_secs,
            end: end_secs,
            reason: reason.to_string(),
        };
        if !start_secs.is_finite() || !end_secs.is_finite() {
            return Err(invalid("offsets must be finite"));
        }
        if start_secs < 0.0 || end_secs < 0.0 {
            return Err(invalid("offsets must be non-negative"));
        }
        if start_secs > end_secs {
            return Err(invalid("start is after end"));
        }
        Ok(Self {
            start: Duration::from_secs_f64(start_secs),
            end: Duration::from_secs_f64(end_secs),
        })
    }

    pub fn start(&self) -> Duration {
        self.start
    }

    pub fn end(&self) -> Duration {
        self.end
    }

    /// Absolute instants of the window for a statement started at `started`.
    pub fn deadlines(&self, started: Instant) -> (Instant, Instant) {
        (started + self.start, started + self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_validation() {
        let window = SuspendWindow::new(1.0, 1.5).unwrap();
        assert_eq!(window.start(), Duration::from_millis(1000));
        assert_eq!(window.end(), Duration::from_millis(1500));
        assert!(SuspendWindow::new(0.0, 0.0).is_ok());

        for (start, end) in [(2.0, 1.0), (-1.0, 1.0), (0.0, -0.5), (f64::NAN, 1.0)] {
            assert!(matches!(
                SuspendWindow::new(start, end),
                Err(RatchetError::SuspendWindowInvalid { .. })
            ));
        }
    }
}
