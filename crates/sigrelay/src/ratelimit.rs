use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Which per-connection budget a message would exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// Too many messages in the window.
    Messages,
    /// Too many bytes in the window.
    Bandwidth,
}

impl Throttle {
    /// Metric label for the drop reason.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Messages => "msg_rate",
            Self::Bandwidth => "bw_rate",
        }
    }
}

/// Granularity of the window; messages within one bucket expire together.
const BUCKET: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    started: Instant,
    messages: u32,
    bytes: u64,
}

/// Sliding-window limiter on inbound messages and bytes for one connection.
///
/// Accepted messages are counted into one-second buckets, so a burst just
/// before and just after a minute boundary still counts against one window
/// while memory per connection stays at about sixty buckets whatever the
/// configured rate.
#[derive(Debug)]
pub struct RateLimiter {
    msg_rate: u32,
    bw_rate: u64,
    buckets: VecDeque<Bucket>,
    messages_in_window: u32,
    bytes_in_window: u64,
}

impl RateLimiter {
    /// Creates a limiter allowing `msg_rate` messages and `bw_rate` bytes per minute.
    #[must_use]
    pub fn new(msg_rate: u32, bw_rate: u64) -> Self {
        Self {
            msg_rate,
            bw_rate,
            buckets: VecDeque::with_capacity(8),
            messages_in_window: 0,
            bytes_in_window: 0,
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(bucket) = self.buckets.front() {
            if now.duration_since(bucket.started) < WINDOW {
                break;
            }
            self.messages_in_window = self.messages_in_window.saturating_sub(bucket.messages);
            self.bytes_in_window = self.bytes_in_window.saturating_sub(bucket.bytes);
            self.buckets.pop_front();
        }
    }

    /// Admit a message of `bytes` bytes, recording it on success.
    ///
    /// # Errors
    ///
    /// Returns the exceeded [`Throttle`]; nothing is recorded in that case.
    pub fn check(&mut self, bytes: usize) -> Result<(), Throttle> {
        self.check_at(Instant::now(), bytes)
    }

    fn check_at(&mut self, now: Instant, bytes: usize) -> Result<(), Throttle> {
        self.expire(now);

        let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
        if self.messages_in_window >= self.msg_rate {
            return Err(Throttle::Messages);
        }
        if self.bytes_in_window.saturating_add(bytes) > self.bw_rate {
            return Err(Throttle::Bandwidth);
        }

        match self.buckets.back_mut() {
            Some(bucket) if now.duration_since(bucket.started) < BUCKET => {
                bucket.messages += 1;
                bucket.bytes = bucket.bytes.saturating_add(bytes);
            }
            _ => self.buckets.push_back(Bucket {
                started: now,
                messages: 1,
                bytes,
            }),
        }
        self.messages_in_window += 1;
        self.bytes_in_window = self.bytes_in_window.saturating_add(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_messages_within_limits() {
        let mut limiter = RateLimiter::new(10, 1000);
        assert!(limiter.check(100).is_ok());
        assert!(limiter.check(50).is_ok());
        assert_eq!(limiter.messages_in_window, 2);
        assert_eq!(limiter.bytes_in_window, 150);
    }

    #[test]
    fn message_budget_exhausted() {
        let mut limiter = RateLimiter::new(3, 1000);
        for _ in 0..3 {
            assert!(limiter.check(1).is_ok());
        }
        assert_eq!(limiter.check(1), Err(Throttle::Messages));
        assert_eq!(limiter.messages_in_window, 3);
    }

    #[test]
    fn byte_budget_exhausted() {
        let mut limiter = RateLimiter::new(10, 1000);
        assert!(limiter.check(950).is_ok());
        assert_eq!(limiter.check(100), Err(Throttle::Bandwidth));
        assert_eq!(limiter.bytes_in_window, 950);
        assert!(limiter.check(50).is_ok());
    }

    #[test]
    fn old_entries_expire_after_window() {
        let mut limiter = RateLimiter::new(2, 1000);
        let start = Instant::now();
        assert!(limiter.check_at(start, 400).is_ok());
        assert!(limiter.check_at(start, 400).is_ok());
        assert_eq!(limiter.check_at(start, 1), Err(Throttle::Messages));

        let later = start + WINDOW;
        assert!(limiter.check_at(later, 1).is_ok());
        assert_eq!(limiter.bytes_in_window, 1);
    }

    #[test]
    fn window_slides_instead_of_resetting() {
        let mut limiter = RateLimiter::new(2, 1000);
        let start = Instant::now();
        assert!(limiter.check_at(start, 1).is_ok());
        assert!(limiter.check_at(start + Duration::from_secs(59), 1).is_ok());

        // first entry expired, second still counts
        let edge = start + Duration::from_secs(61);
        assert!(limiter.check_at(edge, 1).is_ok());
        assert_eq!(limiter.check_at(edge, 1), Err(Throttle::Messages));
    }

    #[test]
    fn memory_is_bounded_by_window_not_rate() {
        let mut limiter = RateLimiter::new(1_000_000, u64::MAX);
        let start = Instant::now();
        for i in 0..200_000u64 {
            let at = start + Duration::from_millis(i);
            assert!(limiter.check_at(at, 1).is_ok());
            assert!(limiter.buckets.len() <= 61);
        }
        // the oldest 140 s have aged out; only the last minute is counted
        assert!(limiter.messages_in_window <= 61_000);
        assert!(limiter.messages_in_window >= 59_000);
    }

    #[test]
    fn bucket_expiry_releases_both_budgets() {
        let mut limiter = RateLimiter::new(3, 300);
        let start = Instant::now();
        for ms in [0, 200, 400] {
            assert!(limiter
                .check_at(start + Duration::from_millis(ms), 100)
                .is_ok());
        }
        assert_eq!(limiter.buckets.len(), 1);
        assert_eq!(
            limiter.check_at(start + Duration::from_secs(30), 1),
            Err(Throttle::Messages)
        );

        assert!(limiter.check_at(start + WINDOW, 300).is_ok());
        assert_eq!(limiter.messages_in_window, 1);
        assert_eq!(limiter.bytes_in_window, 300);
    }

    #[test]
    fn throttle_labels() {
        assert_eq!(Throttle::Messages.as_label(), "msg_rate");
        assert_eq!(Throttle::Bandwidth.as_label(), "bw_rate");
    }
}
