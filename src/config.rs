//! Engine configuration
//!
//! Bounds the pseudo-random address search so a nearly full device reports
//! exhaustion instead of spinning.

/// Retry bound for the password-seeded address search
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchLimits {
    /// Candidate draws allowed per addressable block
    pub attempts_per_block: u64,
    /// Floor for the bound on very small devices
    pub min_attempts: u64,
}

impl SearchLimits {
    /// Production values (4 draws per block, at least 4096)
    pub const PROD: Self = Self {
        attempts_per_block: 4,
        min_attempts: 4096,
    };

    /// Test values (one draw per block, at least 256)
    pub const TEST: Self = Self {
        attempts_per_block: 1,
        min_attempts: 256,
    };

    /// Maximum candidate draws for a device of `total_blocks` blocks
    ///
    /// Allocation and retrieval share this bound, so any head that `hide`
    /// could place is reachable by `retrieve`.
    #[must_use]
    pub fn max_attempts(&self, total_blocks: u64) -> u64 {
        self.attempts_per_block
            .saturating_mul(total_blocks)
            .max(self.min_attempts)
    }
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self::PROD
    }
}

/// Engine configuration
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineConfig {
    limits: SearchLimits,
}

impl EngineConfig {
    /// Create config with production search limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config with custom search limits
    pub fn with_limits(limits: SearchLimits) -> Self {
        Self { limits }
    }

    /// Get search limits
    pub fn limits(&self) -> &SearchLimits {
        &self.limits
    }
}
