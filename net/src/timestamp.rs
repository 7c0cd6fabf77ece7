use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock time with microsecond resolution.
///
/// A `Timestamp` is a plain microseconds-since-epoch scalar with a total
/// order, which makes it cheap to copy into timer keys and poll results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const MICROS_PER_SECOND: i64 = 1_000_000;

    /// Sample the current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp(since_epoch.as_micros() as i64)
    }

    /// Construct from a raw microseconds-since-epoch value.
    #[inline]
    pub fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    /// Microseconds since the epoch.
    #[inline]
    pub fn micros(&self) -> i64 {
        self.0
    }

    /// A zero timestamp, ordered before every sampled one.
    #[inline]
    pub fn invalid() -> Self {
        Timestamp(0)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Add a floating-point seconds delta.
    #[inline]
    pub fn add_seconds(self, seconds: f64) -> Self {
        let delta = (seconds * Self::MICROS_PER_SECOND as f64) as i64;
        Timestamp(self.0 + delta)
    }

    /// Add a `Duration`.
    #[inline]
    pub fn add_duration(self, d: Duration) -> Self {
        Timestamp(self.0 + d.as_micros() as i64)
    }

    /// Signed microsecond difference `self - earlier`.
    #[inline]
    pub fn micros_since(&self, earlier: Timestamp) -> i64 {
        self.0 - earlier.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 / Self::MICROS_PER_SECOND;
        let micros = self.0 % Self::MICROS_PER_SECOND;
        write!(f, "{secs}.{micros:06}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_valid() {
        assert!(Timestamp::now().is_valid());
        assert!(!Timestamp::invalid().is_valid());
    }

    #[test]
    fn test_ordering() {
        let a = Timestamp::from_micros(1_000);
        let b = Timestamp::from_micros(2_000);
        assert!(a < b);
        assert_eq!(a, Timestamp::from_micros(1_000));
    }

    #[test]
    fn test_add_seconds() {
        let t = Timestamp::from_micros(1_000_000);
        assert_eq!(t.add_seconds(1.5).micros(), 2_500_000);
        assert_eq!(t.add_seconds(0.000_001).micros(), 1_000_001);
    }

    #[test]
    fn test_add_duration_matches_add_seconds() {
        let t = Timestamp::now();
        assert_eq!(
            t.add_duration(Duration::from_millis(250)),
            t.add_seconds(0.25)
        );
    }

    #[test]
    fn test_display() {
        let t = Timestamp::from_micros(1_000_042);
        assert_eq!(t.to_string(), "1.000042");
    }
}
