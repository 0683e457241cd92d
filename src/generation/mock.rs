//! Generators that need no external service.

use std::time::Duration;

use async_trait::async_trait;
use rand::RngExt;

use super::Generator;
use crate::error::GenerationError;

/// Default lower bound of the simulated delay in seconds.
pub const DEFAULT_MIN_DELAY_SECS: f64 = 2.0;

/// Default upper bound of the simulated delay in seconds.
pub const DEFAULT_MAX_DELAY_SECS: f64 = 5.0;

/// Simulates a model: sleeps a random delay, then echoes the prompt.
#[derive(Debug, Clone)]
pub struct MockGenerator {
    min_delay: Duration,
    max_delay: Duration,
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::from_secs(DEFAULT_MIN_DELAY_SECS, DEFAULT_MAX_DELAY_SECS)
    }
}

impl MockGenerator {
    /// Creates a generator sleeping between `min_delay` and `max_delay`.
    /// The bounds are swapped if given in the wrong order.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        if min_delay <= max_delay {
            Self { min_delay, max_delay }
        } else {
            Self {
                min_delay: max_delay,
                max_delay: min_delay,
            }
        }
    }

    /// Creates a generator from bounds in (possibly fractional) seconds.
    /// Negative values count as zero.
    pub fn from_secs(min_secs: f64, max_secs: f64) -> Self {
        Self::new(
            Duration::from_secs_f64(min_secs.max(0.0)),
            Duration::from_secs_f64(max_secs.max(0.0)),
        )
    }

    /// A generator that answers immediately.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    fn pick_delay(&self) -> Duration {
        if self.min_delay == self.max_delay {
            return self.min_delay;
        }
        let mut rng = rand::rng();
        let secs = rng.random_range(self.min_delay.as_secs_f64()..=self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let delay = self.pick_delay();
        tokio::time::sleep(delay).await;

        Ok(format!(
            "Generated response for prompt: '{}'\n\nThis is a simulated completion \
             produced after {:.2}s of processing.",
            prompt,
            delay.as_secs_f64()
        ))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Returns the same text for every prompt, optionally after a delay.
#[derive(Debug, Clone)]
pub struct FixedGenerator {
    response: String,
    delay: Duration,
}

impl FixedGenerator {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            delay: Duration::ZERO,
        }
    }

    /// Sleeps `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Generator for FixedGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.response.clone())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_are_ordered() {
        let generator = MockGenerator::from_secs(5.0, 2.0);
        assert!(generator.min_delay <= generator.max_delay);
        assert_eq!(generator.min_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_delay_within_bounds() {
        let generator = MockGenerator::new(Duration::from_millis(10), Duration::from_millis(20));
        for _ in 0..50 {
            let delay = generator.pick_delay();
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(20));
        }
    }

    #[tokio::test]
    async fn test_mock_echoes_prompt() {
        let output = MockGenerator::instant()
            .generate("Write a haiku")
            .await
            .expect("mock never fails");

        assert!(output.contains("Write a haiku"));
    }

    #[tokio::test]
    async fn test_fixed_generator() {
        let generator = FixedGenerator::new("pong");
        assert_eq!(generator.generate("ping").await.expect("fixed"), "pong");
        assert_eq!(generator.name(), "fixed");
    }
}
