//! Frame source abstraction and bounded open-retry.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::time::Duration;

/// Anything that yields grayscale frames: a V4L2 device, a test fixture.
///
/// `close` must be idempotent; a closed source may be opened again.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), CameraError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    fn next_frame(&mut self) -> Result<Frame, CameraError>;

    fn describe(&self) -> String {
        "frame source".to_string()
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn open(&mut self) -> Result<(), CameraError> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        (**self).next_frame()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// How hard to try when (re)opening a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay after the first failure; doubled after each further one.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` failures so far (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Open `source`, retrying with backoff. Returns the number of attempts used.
pub fn open_with_retry(source: &mut dyn FrameSource, policy: &RetryPolicy) -> Result<u32, CameraError> {
    let attempts = policy.attempts.max(1);
    let mut last = String::new();

    for attempt in 1..=attempts {
        match source.open() {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!(source = %source.describe(), attempt, "frame source opened after retry");
                }
                return Ok(attempt);
            }
            Err(e) => {
                tracing::warn!(source = %source.describe(), attempt, attempts, error = %e, "failed to open frame source");
                last = e.to_string();
                source.close();
                if attempt < attempts {
                    std::thread::sleep(policy.delay_after(attempt));
                }
            }
        }
    }

    tracing::error!(source = %source.describe(), attempts, "giving up on frame source");
    Err(CameraError::RetriesExhausted { attempts, last })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        failures_left: u32,
        opens: u32,
        open: bool,
    }

    impl FrameSource for Flaky {
        fn open(&mut self) -> Result<(), CameraError> {
            self.opens += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(CameraError::DeviceBusy);
            }
            self.open = true;
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            Ok(Frame::from_gray(vec![128; 4], 2, 2, 0))
        }
    }

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn test_opens_after_transient_failures() {
        let mut source = Flaky { failures_left: 2, opens: 0, open: false };
        let used = open_with_retry(&mut source, &quick(5)).unwrap();
        assert_eq!(used, 3);
        assert!(source.is_open());
    }

    #[test]
    fn test_gives_up_after_attempts() {
        let mut source = Flaky { failures_left: 10, opens: 0, open: false };
        let err = open_with_retry(&mut source, &quick(3)).unwrap_err();
        assert!(matches!(err, CameraError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(source.opens, 3);
        assert!(!source.is_open());
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let mut source = Flaky { failures_left: 0, opens: 0, open: false };
        assert_eq!(open_with_retry(&mut source, &quick(0)).unwrap(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 10,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(4), Duration::from_secs(3));
        assert_eq!(policy.delay_after(40), Duration::from_secs(3));
    }
}
