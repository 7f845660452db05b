use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Runs an action at most once per interval, however often it is triggered.
///
/// The first trigger always passes.
pub struct Throttle {
    interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time left until the next trigger would pass.
    pub fn remaining(&self) -> Duration {
        let last = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) => self.interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Claim the current window. Returns false if the action already ran in it.
    pub fn ready(&self) -> bool {
        let mut last = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = *last {
            if at.elapsed() < self.interval {
                return false;
            }
        }
        *last = Some(Instant::now());
        true
    }

    /// Run `action` if the window is open; returns whether it ran.
    pub fn run<F: FnOnce()>(&self, action: F) -> bool {
        if !self.ready() {
            return false;
        }
        action();
        true
    }

    /// Restart the window as if the action had just run.
    pub fn reset(&self) {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_trigger_passes_then_blocks() {
        let throttle = Throttle::new(Duration::from_secs(60));
        let mut runs = 0;
        for _ in 0..10 {
            throttle.run(|| runs += 1);
        }
        assert_eq!(runs, 1);
        assert!(throttle.remaining() > Duration::from_secs(59));
    }

    #[test]
    fn test_window_reopens() {
        let throttle = Throttle::new(Duration::from_millis(20));
        assert!(throttle.ready());
        assert!(!throttle.ready());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(throttle.remaining(), Duration::ZERO);
        assert!(throttle.ready());
    }
}
