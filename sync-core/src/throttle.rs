//! Leading + trailing edge throttle for status notifications.
//!
//! The first value in a quiet period is emitted immediately. Values offered
//! inside the window collapse into one pending value that is emitted when the
//! window closes, so observers always end on the latest state.

use std::time::{Duration, Instant};

/// Default throttle window for status events.
pub const DEFAULT_STATUS_WINDOW: Duration = Duration::from_millis(500);

/// Collapses bursts of values into at most one emission per window.
#[derive(Debug, Clone)]
pub struct StatusThrottle<T> {
    window: Duration,
    last_emit: Option<Instant>,
    last_value: Option<T>,
    pending: Option<T>,
}

impl<T: Clone + PartialEq> StatusThrottle<T> {
    /// Create a throttle with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: None,
            last_value: None,
            pending: None,
        }
    }

    /// Offer a new value. Returns the value if it should be emitted now.
    pub fn offer(&mut self, value: T, now: Instant) -> Option<T> {
        if self.last_value.as_ref() == Some(&value) {
            // Back to what observers already have.
            self.pending = None;
            return None;
        }
        match self.last_emit {
            Some(at) if now.saturating_duration_since(at) < self.window => {
                self.pending = Some(value);
                None
            }
            _ => self.emit(value, now),
        }
    }

    /// Release the pending value if its window has closed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        let deadline = self.next_deadline()?;
        if now < deadline {
            return None;
        }
        let value = self.pending.take()?;
        self.emit(value, now)
    }

    /// When the pending value becomes due, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(match self.last_emit {
            Some(at) => at + self.window,
            None => Instant::now(),
        })
    }

    /// Whether a value is waiting for the window to close.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        self.last_emit = None;
        self.last_value = None;
        self.pending = None;
    }

    fn emit(&mut self, value: T, now: Instant) -> Option<T> {
        self.last_emit = Some(now);
        self.last_value = Some(value.clone());
        self.pending = None;
        Some(value)
    }
}

impl<T: Clone + PartialEq> Default for StatusThrottle<T> {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(500);

    #[test]
    fn first_value_emits_immediately() {
        let mut throttle = StatusThrottle::new(WINDOW);
        assert_eq!(throttle.offer(1, Instant::now()), Some(1));
    }

    #[test]
    fn burst_collapses_to_leading_and_trailing() {
        let mut throttle = StatusThrottle::new(WINDOW);
        let start = Instant::now();
        let mut emitted = Vec::new();

        // Ten transitions within 200ms
        for i in 0..10u32 {
            let at = start + Duration::from_millis(i as u64 * 20);
            emitted.extend(throttle.offer(i, at));
        }
        assert_eq!(emitted, vec![0]);
        assert!(throttle.has_pending());

        let deadline = throttle.next_deadline().unwrap();
        assert_eq!(deadline, start + WINDOW);
        assert_eq!(throttle.poll(deadline - Duration::from_millis(1)), None);
        emitted.extend(throttle.poll(deadline));

        assert_eq!(emitted, vec![0, 9]);
        assert!(!throttle.has_pending());
    }

    #[test]
    fn value_after_window_emits_immediately() {
        let mut throttle = StatusThrottle::new(WINDOW);
        let start = Instant::now();
        throttle.offer("connecting", start);
        assert_eq!(
            throttle.offer("connected", start + WINDOW),
            Some("connected")
        );
    }

    #[test]
    fn returning_to_last_emitted_value_drops_pending() {
        let mut throttle = StatusThrottle::new(WINDOW);
        let start = Instant::now();
        throttle.offer("connected", start);
        throttle.offer("degraded", start + Duration::from_millis(10));
        assert!(throttle.has_pending());

        assert_eq!(
            throttle.offer("connected", start + Duration::from_millis(20)),
            None
        );
        assert!(!throttle.has_pending());
        assert_eq!(throttle.poll(start + WINDOW), None);
    }

    #[test]
    fn duplicate_values_are_suppressed() {
        let mut throttle = StatusThrottle::new(WINDOW);
        let start = Instant::now();
        throttle.offer(5, start);
        assert_eq!(throttle.offer(5, start + WINDOW * 2), None);
    }

    #[test]
    fn reset_forgets_history() {
        let mut throttle = StatusThrottle::new(WINDOW);
        let start = Instant::now();
        throttle.offer(1, start);
        throttle.reset();
        assert_eq!(throttle.offer(1, start), Some(1));
    }
}
