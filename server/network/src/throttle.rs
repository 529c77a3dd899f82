use std::time::{Duration, Instant};

/// Gate on reconnect attempts to a server peer. Every failed connection
/// doubles the wait before the next attempt, up to a cap; a successful
/// handshake resets it.
#[derive(Debug)]
pub struct ConnectionThrottle {
    initial: Duration,
    max: Duration,
    current: Duration,
    blocked_until: Option<Instant>,
}

impl ConnectionThrottle {
    pub fn new(initial: Duration, max: Duration) -> ConnectionThrottle {
        ConnectionThrottle { initial, max, current: initial, blocked_until: None }
    }

    pub fn may_connect(&self, now: Instant) -> bool {
        match self.blocked_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    pub fn on_failure(&mut self, now: Instant) {
        self.blocked_until = Some(now + self.current);
        self.current = (self.current * 2).min(self.max);
    }

    pub fn on_success(&mut self) {
        self.current = self.initial;
        self.blocked_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backs_off_exponentially_and_resets() {
        let mut throttle =
            ConnectionThrottle::new(Duration::from_millis(100), Duration::from_millis(400));
        let t0 = Instant::now();
        assert!(throttle.may_connect(t0));

        throttle.on_failure(t0);
        assert!(!throttle.may_connect(t0));
        assert!(throttle.may_connect(t0 + Duration::from_millis(100)));

        throttle.on_failure(t0);
        assert!(!throttle.may_connect(t0 + Duration::from_millis(150)));
        assert!(throttle.may_connect(t0 + Duration::from_millis(200)));

        // Capped.
        throttle.on_failure(t0);
        throttle.on_failure(t0);
        throttle.on_failure(t0);
        assert!(throttle.may_connect(t0 + Duration::from_millis(400)));

        throttle.on_success();
        assert!(throttle.may_connect(t0));
    }
}
