use std::{collections::HashMap, hash::Hash, time::Duration};
use tokio::time::Instant;

/// Decides how long an item has to wait before it is re-queued after a failure.
///
/// Implementations are owned by the [`WorkQueue`](crate::WorkQueue) and only ever
/// accessed while holding its lock, hence `&mut self`.
pub trait RateLimiter<T>: Send {
    /// Register one more failure for `item` and get the delay before it may be retried.
    fn when(&mut self, item: &T) -> Duration;
    /// Stop tracking `item`, e.g. because it was processed successfully.
    fn forget(&mut self, item: &T);
    /// Stop tracking all items.
    fn clear(&mut self);
    /// Number of failures currently tracked for `item`.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ExponentialFailureRateLimiter<T> {
    failures: HashMap<T, u32>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> ExponentialFailureRateLimiter<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: HashMap::new(),
            base_delay,
            max_delay,
        }
    }
}

impl<T> Default for ExponentialFailureRateLimiter<T> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<T> RateLimiter<T> for ExponentialFailureRateLimiter<T>
where
    T: Clone + Eq + Hash + Send,
{
    fn when(&mut self, item: &T) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);
        2u32.checked_pow(exp)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }

    fn clear(&mut self) {
        self.failures.clear();
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }
}

/// Overall token bucket, limiting the retry rate across all items.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }
}

impl Default for BucketRateLimiter {
    fn default() -> Self {
        Self::new(10.0, 100)
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&mut self, _item: &T) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst) - 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // A bucket which (almost) never refills yields delays beyond `Duration`.
            Duration::try_from_secs_f64(-self.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&mut self, _item: &T) {}

    fn clear(&mut self) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines several limiters, the longest delay wins.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&mut self, item: &T) -> Duration {
        self.limiters
            .iter_mut()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, item: &T) {
        for l in self.limiters.iter_mut() {
            l.forget(item);
        }
    }

    fn clear(&mut self) {
        for l in self.limiters.iter_mut() {
            l.clear();
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per item exponential backoff (5ms to 1000s) combined with an overall
/// bucket of 10 qps and a burst of 100.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::<T>::default()),
        Box::new(BucketRateLimiter::default()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_grows_and_resets() {
        let mut limiter =
            ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = "test/web".to_string();
        let delays: Vec<Duration> = (0..3).map(|_| limiter.when(&key)).collect();
        assert_eq!(
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20)
            ],
            delays
        );
        assert!(delays.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(3, limiter.num_requeues(&key));

        limiter.forget(&key);
        assert_eq!(0, limiter.num_requeues(&key));
        assert!(limiter.failures.is_empty());
        assert_eq!(Duration::from_millis(5), limiter.when(&key));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let mut limiter =
            ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = "test/web".to_string();
        let mut previous = Duration::ZERO;
        for _ in 0..100 {
            let delay = limiter.when(&key);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(1));
            previous = delay;
        }
        assert_eq!(Duration::from_secs(1), previous);
    }

    #[test]
    fn keys_are_tracked_independently() {
        let mut limiter = ExponentialFailureRateLimiter::default();
        limiter.when(&"a");
        limiter.when(&"a");
        assert_eq!(Duration::from_millis(5), limiter.when(&"b"));
        assert_eq!(2, limiter.num_requeues(&"a"));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_throttles() {
        let mut limiter = BucketRateLimiter::new(10.0, 2);
        assert_eq!(Duration::ZERO, RateLimiter::<&str>::when(&mut limiter, &"a"));
        assert_eq!(Duration::ZERO, RateLimiter::<&str>::when(&mut limiter, &"b"));
        let delay = RateLimiter::<&str>::when(&mut limiter, &"c");
        assert!(delay > Duration::ZERO && delay <= Duration::from_millis(100));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(Duration::ZERO, RateLimiter::<&str>::when(&mut limiter, &"d"));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_without_refill_saturates() {
        for qps in [0.0, -1.0, f64::NAN] {
            let mut limiter = BucketRateLimiter::new(qps, 1);
            assert_eq!(Duration::ZERO, RateLimiter::<&str>::when(&mut limiter, &"a"));
            assert_eq!(Duration::MAX, RateLimiter::<&str>::when(&mut limiter, &"b"));
            assert_eq!(Duration::MAX, RateLimiter::<&str>::when(&mut limiter, &"c"));
        }
    }

    #[test]
    fn clear_drops_all_history() {
        let mut limiter = default_controller_rate_limiter();
        limiter.when(&"a");
        limiter.when(&"b");
        limiter.when(&"b");
        limiter.clear();
        assert_eq!(0, limiter.num_requeues(&"a"));
        assert_eq!(0, limiter.num_requeues(&"b"));
    }

    #[tokio::test(start_paused = true)]
    async fn max_of_takes_longest_delay() {
        let mut limiter = MaxOfRateLimiter::new(vec![
            Box::new(ExponentialFailureRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(1),
            )),
            Box::new(BucketRateLimiter::new(1.0, 1)),
        ]);
        assert_eq!(Duration::from_millis(5), limiter.when(&"a"));
        // The bucket is exhausted now and dominates the exponential backoff.
        assert!(limiter.when(&"a") >= Duration::from_millis(900));
        assert_eq!(2, limiter.num_requeues(&"a"));
        limiter.forget(&"a");
        assert_eq!(0, limiter.num_requeues(&"a"));
    }
}
