//! Sleep abstraction so deferred work can be tested without waiting.

use std::thread;
use std::time::Duration;

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Production sleeper that uses `thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealSleeper;

impl Sleeper for RealSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use mock::MockSleeper;

#[cfg(any(test, feature = "test-support"))]
mod mock {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use canopy_common::mutex_lock_or_recover;

    use super::Sleeper;

    /// Records requested sleeps and returns immediately.
    #[derive(Debug, Default)]
    pub struct MockSleeper {
        call_count: AtomicU64,
        durations: Mutex<Vec<Duration>>,
    }

    impl MockSleeper {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn call_count(&self) -> u64 {
            self.call_count.load(Ordering::SeqCst)
        }

        pub fn durations(&self) -> Vec<Duration> {
            mutex_lock_or_recover(&self.durations).clone()
        }

        pub fn total_duration(&self) -> Duration {
            self.durations().iter().sum()
        }
    }

    impl Sleeper for MockSleeper {
        fn sleep(&self, duration: Duration) {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            mutex_lock_or_recover(&self.durations).push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_sleeper_sleeps() {
        let start = std::time::Instant::now();
        RealSleeper.sleep(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_mock_sleeper_records_without_sleeping() {
        let sleeper = MockSleeper::new();
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_millis(1000));
        sleeper.sleep(Duration::from_millis(20));

        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(sleeper.call_count(), 2);
        assert_eq!(sleeper.total_duration(), Duration::from_millis(1020));
        assert_eq!(
            sleeper.durations(),
            vec![Duration::from_millis(1000), Duration::from_millis(20)]
        );
    }
}
