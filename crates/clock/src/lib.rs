//! Scaled monotone time source.
//!
//! Every component of the stack derives its deadlines from one [`Clock`].
//! The clock advances with wall time multiplied by a scaling factor; a
//! scaling of 0 pauses it entirely. Components never read wall time
//! directly.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const NS_PER_SEC: i64 = 1_000_000_000;

/// Unscaled wall time in nanoseconds since the unix epoch.
pub fn system_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Monotone, scalable time source.
///
/// `now()` never decreases: when the scaling changes, the scaled timeline is
/// re-anchored at the current scaled time.
pub struct Clock {
    // scaling stored as f64 bits so reads stay lock-free on the hot path
    scaling: AtomicU64,
    offset: AtomicI64,
    anchor: AtomicI64,
    listeners: Mutex<Vec<std::sync::mpsc::Sender<f64>>>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        let start = system_time();
        Self {
            scaling: AtomicU64::new(1.0f64.to_bits()),
            offset: AtomicI64::new(start),
            anchor: AtomicI64::new(start),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Current time on the scaled timeline, in nanoseconds.
    pub fn now(&self) -> i64 {
        let scaling = f64::from_bits(self.scaling.load(Ordering::Acquire));
        let anchor = self.anchor.load(Ordering::Acquire);
        let offset = self.offset.load(Ordering::Acquire);
        let elapsed = system_time() - anchor;
        offset + (elapsed as f64 * scaling) as i64
    }

    pub fn scaling(&self) -> f64 {
        f64::from_bits(self.scaling.load(Ordering::Acquire))
    }

    /// Changes the speed of the scaled timeline. 0 pauses, 1 is real time.
    ///
    /// Registered listeners are notified so periodic timers can re-arm.
    pub fn set_scaling(&self, scaling: f64) {
        let scaling = scaling.max(0.0);
        // re-anchor so now() is continuous across the change
        let current = self.now();
        self.offset.store(current, Ordering::Release);
        self.anchor.store(system_time(), Ordering::Release);
        self.scaling.store(scaling.to_bits(), Ordering::Release);

        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|tx| tx.send(scaling).is_ok());
    }

    /// Registers a channel that receives every scaling change.
    pub fn subscribe_scaling(&self) -> std::sync::mpsc::Receiver<f64> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    /// Timer interval for a periodic task with the given base period,
    /// adjusted for the current scaling and clamped to >= 1 ms.
    ///
    /// Returns `None` while the clock is paused.
    pub fn tick_interval(&self, base_ms: u64) -> Option<Duration> {
        let scaling = self.scaling();
        if scaling <= 0.0 {
            return None;
        }
        let ms = ((base_ms as f64 / scaling) as u64).max(1);
        Some(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotone() {
        let clock = Clock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let t = clock.now();
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn paused_clock_stands_still() {
        let clock = Clock::new();
        clock.set_scaling(0.0);
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.now();
        assert_eq!(a, b);
        assert!(clock.tick_interval(10).is_none());
    }

    #[test]
    fn scaling_change_is_continuous() {
        let clock = Clock::new();
        let before = clock.now();
        clock.set_scaling(2.0);
        let after = clock.now();
        // no jump across the re-anchoring
        assert!(after - before < NS_PER_SEC / 100);
    }

    #[test]
    fn tick_interval_scales_and_clamps() {
        let clock = Clock::new();
        assert_eq!(clock.tick_interval(10), Some(Duration::from_millis(10)));
        clock.set_scaling(0.5);
        assert_eq!(clock.tick_interval(10), Some(Duration::from_millis(20)));
        clock.set_scaling(100.0);
        assert_eq!(clock.tick_interval(10), Some(Duration::from_millis(1)));
    }

    #[test]
    fn listeners_see_scaling_changes() {
        let clock = Clock::new();
        let rx = clock.subscribe_scaling();
        clock.set_scaling(0.5);
        assert_eq!(rx.recv().unwrap(), 0.5);
    }
}
