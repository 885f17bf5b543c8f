use std::time::{Duration, Instant};

/// Default minimum spacing between cursor broadcasts (about 20 Hz)
pub const CURSOR_INTERVAL: Duration = Duration::from_millis(50);

/// Rate limiter for cursor broadcasts
///
/// Calls inside the window are dropped, not queued: the first call after the
/// window reopens is the one that gets sent.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent_at: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent_at: None,
        }
    }

    /// Check if a send is allowed now, and record it if so
    pub fn should_send(&mut self) -> bool {
        self.should_send_at(Instant::now())
    }

    pub fn should_send_at(&mut self, now: Instant) -> bool {
        match self.last_sent_at {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_sent_at = Some(now);
                true
            }
        }
    }

    /// Forget the last send (e.g. after reconnecting)
    pub fn reset(&mut self) {
        self.last_sent_at = None;
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(CURSOR_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_is_sent() {
        let mut throttle = CursorThrottle::default();
        assert!(throttle.should_send_at(Instant::now()));
    }

    #[test]
    fn at_most_one_send_per_window() {
        let mut throttle = CursorThrottle::default();
        let start = Instant::now();

        // A pointer-move every 10ms for 200ms
        let sent: Vec<u64> = (0..20u64)
            .filter(|i| throttle.should_send_at(start + Duration::from_millis(i * 10)))
            .collect();

        assert_eq!(sent, vec![0, 5, 10, 15]);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let mut throttle = CursorThrottle::default();
        let start = Instant::now();

        assert!(throttle.should_send_at(start));
        assert!(!throttle.should_send_at(start + Duration::from_millis(49)));
        assert!(throttle.should_send_at(start + Duration::from_millis(50)));
    }

    #[test]
    fn reset_reopens_window() {
        let mut throttle = CursorThrottle::default();
        let start = Instant::now();

        assert!(throttle.should_send_at(start));
        throttle.reset();
        assert!(throttle.should_send_at(start + Duration::from_millis(1)));
    }
}
