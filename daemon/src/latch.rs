use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;

/// One-shot latch the session threads park on.
///
/// A latch starts armed. `trip()` releases every current and future waiter
/// and is idempotent. `wait_timeout` reports whether the full timeout
/// elapsed, which is how the duration thread distinguishes "capture window
/// expired" from "session ended first".
pub struct Latch {
    tripped: Mutex<bool>,
    cond: Condvar,
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

impl Latch {
    pub fn new() -> Latch {
        Latch {
            tripped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn trip(&self) {
        let mut tripped = self.tripped.lock().unwrap();
        *tripped = true;
        self.cond.notify_all();
    }

    pub fn is_tripped(&self) -> bool {
        *self.tripped.lock().unwrap()
    }

    /// Block until the latch trips.
    pub fn wait(&self) {
        let mut tripped = self.tripped.lock().unwrap();
        while !*tripped {
            tripped = self.cond.wait(tripped).unwrap();
        }
    }

    /// Block until the latch trips or `timeout` elapses. Returns true iff
    /// the timeout elapsed with the latch still armed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut tripped = self.tripped.lock().unwrap();
        let mut remaining = timeout;
        loop {
            if *tripped {
                return false;
            }
            let start = std::time::Instant::now();
            let (guard, result) = self.cond.wait_timeout(tripped, remaining).unwrap();
            tripped = guard;
            if result.timed_out() {
                return !*tripped;
            }
            // spurious wakeup, keep waiting out the remainder
            remaining = remaining.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return !*tripped;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn timeout_reports_expiry() {
        let latch = Latch::new();
        assert!(latch.wait_timeout(Duration::from_millis(10)));
        assert!(!latch.is_tripped());
    }

    #[test]
    fn trip_releases_waiters() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        latch.trip();
        // tripped before the timeout
        assert!(!waiter.join().unwrap());
        // and every later wait returns immediately
        latch.wait();
        assert!(!latch.wait_timeout(Duration::from_secs(30)));
    }
}
