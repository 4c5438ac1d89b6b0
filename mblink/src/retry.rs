use std::time::Duration;

/// Trait that controls the delay between failed transaction attempts and
/// reconnect attempts
pub trait RetryStrategy: Send {
    /// Reset internal state. Called after a successful transaction
    fn reset(&mut self);
    /// Return the next delay before making another attempt
    fn after_failed_connect(&mut self) -> Duration;
    /// Return the delay to wait after a disconnect before attempting to reconnect/open
    fn after_disconnect(&mut self) -> Duration;
}

/// Return the default [`RetryStrategy`]
pub fn default_retry_strategy() -> Box<dyn RetryStrategy> {
    doubling_retry_strategy(Duration::from_millis(1000), Duration::from_millis(60000))
}

/// Return a [`RetryStrategy`] that doubles on failure up to a maximum value
pub fn doubling_retry_strategy(min: Duration, max: Duration) -> Box<dyn RetryStrategy> {
    Doubling::create(min, max)
}

struct Doubling {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Doubling {
    fn create(min: Duration, max: Duration) -> Box<dyn RetryStrategy> {
        Box::new(Doubling {
            min,
            max,
            current: min,
        })
    }
}

impl RetryStrategy for Doubling {
    fn reset(&mut self) {
        self.current = self.min;
    }

    fn after_failed_connect(&mut self) -> Duration {
        let ret = self.current;
        self.current = std::cmp::min(2 * self.current, self.max);
        ret
    }

    fn after_disconnect(&mut self) -> Duration {
        self.min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_maximum() {
        let mut strategy =
            doubling_retry_strategy(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(strategy.after_failed_connect(), Duration::from_millis(100));
        assert_eq!(strategy.after_failed_connect(), Duration::from_millis(200));
        assert_eq!(strategy.after_failed_connect(), Duration::from_millis(350));
        assert_eq!(strategy.after_failed_connect(), Duration::from_millis(350));
        strategy.reset();
        assert_eq!(strategy.after_failed_connect(), Duration::from_millis(100));
    }

    #[test]
    fn disconnect_delay_stays_at_the_minimum() {
        let mut strategy =
            doubling_retry_strategy(Duration::from_millis(100), Duration::from_millis(350));
        strategy.after_failed_connect();
        strategy.after_failed_connect();
        assert_eq!(strategy.after_disconnect(), Duration::from_millis(100));
    }
}
