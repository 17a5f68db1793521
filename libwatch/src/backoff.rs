use std::time::Duration;

use rand::Rng;

const JITTER: f64 = 0.15;
const FLOOR: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid backoff bounds: min {min:?} > max {max:?}")]
pub struct InvalidBoundsError {
    pub min: Duration,
    pub max: Duration,
}

/// Exponential backoff with bounded, jittered delays.
///
/// `next(0, min, max)` starts at `min`; any other delay doubles up to `max`.
/// The result carries +-15% uniform jitter and is never below one millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(min: Duration, max: Duration) -> Result<Self, InvalidBoundsError> {
        if min > max {
            return Err(InvalidBoundsError { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn next(&self, current: Duration) -> Duration {
        // bounds were checked in `new`
        next_delay(current, self.min, self.max).unwrap_or(self.max)
    }
}

pub fn next_delay(
    current: Duration,
    min: Duration,
    max: Duration,
) -> Result<Duration, InvalidBoundsError> {
    if min > max {
        return Err(InvalidBoundsError { min, max });
    }
    let base = if current.is_zero() {
        min
    } else {
        current.saturating_mul(2).min(max)
    };
    let factor = rand::rng().random_range((1.0 - JITTER)..=(1.0 + JITTER));
    let jittered = Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(max);
    Ok(jittered.max(FLOOR))
}
