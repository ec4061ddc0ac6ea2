use rand::Rng;
use std::time::{Duration, Instant};

pub const DEFAULT_JITTER_RATIO: f64 = 0.5;
/// A connection that stayed up this long resets the backoff.
pub const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// Exponential reconnect delay with jitter.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter_ratio: f64,
    reset_interval: Duration,
    attempt: u32,
    connected_since: Option<Instant>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max: max.max(initial),
            jitter_ratio: DEFAULT_JITTER_RATIO,
            reset_interval: DEFAULT_RESET_INTERVAL,
            attempt: 0,
            connected_since: None,
        }
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_reset_interval(mut self, interval: Duration) -> Self {
        self.reset_interval = interval;
        self
    }

    pub fn mark_connected(&mut self) {
        self.connected_since = Some(Instant::now());
    }

    /// Delay before the next attempt. Each call without an intervening long
    /// enough connection doubles the base delay up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        if let Some(since) = self.connected_since.take()
            && since.elapsed() >= self.reset_interval
        {
            self.attempt = 0;
        }
        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = (base.as_millis() as f64 * self.jitter_ratio) as u64;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..jitter_ms);
        base - Duration::from_millis(jitter)
    }
}
