use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic point in time with microsecond resolution.
///
/// All scheduling decisions inside one event tick use a single `Timestamp`
/// sampled at the start of the tick. The derived ordering compares seconds
/// first, then microseconds; `micros` is always kept below one million.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    secs: i64,
    micros: u32,
}

static ANCHOR: OnceLock<Instant> = OnceLock::new();

impl Timestamp {
    pub fn new(secs: i64, micros: u32) -> Self {
        let mut ts = Self { secs, micros };
        if ts.micros >= 1_000_000 {
            ts.secs += (ts.micros / 1_000_000) as i64;
            ts.micros %= 1_000_000;
        }
        ts
    }

    /// Current monotonic time, measured from a process-wide anchor.
    pub fn now() -> Self {
        let elapsed = ANCHOR.get_or_init(Instant::now).elapsed();
        Self {
            secs: elapsed.as_secs() as i64,
            micros: elapsed.subsec_micros(),
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new((ms / 1000) as i64, ((ms % 1000) * 1000) as u32)
    }

    pub fn add_millis(self, ms: u64) -> Self {
        Self::new(
            self.secs + (ms / 1000) as i64,
            self.micros + ((ms % 1000) * 1000) as u32,
        )
    }

    /// Whole milliseconds from `earlier` to `self`, zero if `earlier` is
    /// in the future.
    pub fn millis_since(self, earlier: Self) -> u64 {
        if self < earlier {
            return 0;
        }
        let secs = (self.secs - earlier.secs) as u64;
        let micros = self.micros as i64 - earlier.micros as i64;
        (secs as i64 * 1000 + micros / 1000).max(0) as u64
    }
}
