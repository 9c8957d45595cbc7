use std::ops::Sub;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between 01.01.1900 (the NTP epoch) and 01.01.1970
const UNIX_OFFSET: u64 = 2_208_988_800;

/// Timestamp in the 64 bit NTP format used by RTCP sender reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTimestamp {
    /// Duration since 01.01.1900
    inner: Duration,
}

impl NtpTimestamp {
    pub const ZERO: Self = Self {
        inner: Duration::ZERO,
    };

    pub fn now() -> Self {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        Self {
            inner: since_unix + Duration::from_secs(UNIX_OFFSET),
        }
    }

    pub fn as_seconds_f64(self) -> f64 {
        self.inner.as_secs_f64()
    }

    pub fn to_fixed_u64(self) -> u64 {
        let seconds = self.inner.as_secs();
        let subseconds = (self.inner.subsec_nanos() as f64 / 1_000_000_000.) * u32::MAX as f64;

        (seconds << 32) | subseconds as u64
    }

    /// The middle 32 bits, as carried in the LSR field of report blocks
    pub fn to_fixed_u32(self) -> u32 {
        ((self.to_fixed_u64() >> 16) & u64::from(u32::MAX)) as u32
    }

    pub fn from_fixed_u64(fixed: u64) -> Self {
        let seconds = fixed >> 32;

        let subseconds = (fixed & u64::from(u32::MAX)) as u32;
        let subseconds = subseconds as f64 / u32::MAX as f64;

        Self {
            inner: Duration::new(seconds, (subseconds * 1_000_000_000.) as u32),
        }
    }
}

impl Sub for NtpTimestamp {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        self.inner.saturating_sub(rhs.inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_u64_roundtrip() {
        let now = NtpTimestamp::now();
        let roundtripped = NtpTimestamp::from_fixed_u64(now.to_fixed_u64());

        let delta = (now - roundtripped).as_secs_f64();
        assert!(delta < 0.001, "delta was {delta}");
    }

    #[test]
    fn epoch_offset() {
        // any current timestamp is far past the unix offset
        assert!(NtpTimestamp::now().inner.as_secs() > UNIX_OFFSET);
    }
}
