/// Source of randomness for transaction ids, case randomization, server
/// rotation, and retry jitter.
///
/// Kept as a trait so tests can script every draw.
pub trait RandomSource: Send {
    fn fill(&mut self, buf: &mut [u8]);

    fn next_u16(&mut self) -> u16 {
        let mut b = [0u8; 2];
        self.fill(&mut b);
        u16::from_be_bytes(b)
    }
}

/// Default randomness backed by `fastrand`.
pub struct FastRandom(fastrand::Rng);

impl FastRandom {
    pub fn new() -> Self {
        Self(fastrand::Rng::new())
    }

    /// Deterministic stream for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self(fastrand::Rng::with_seed(seed))
    }
}

impl Default for FastRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for FastRandom {
    fn fill(&mut self, buf: &mut [u8]) {
        self.0.fill(buf);
    }
}
