//! Storage configuration
//!
//! Padding distributions, password KDF cost and input limits.
//! `Default` picks the small TEST values in test builds (or with the
//! `test-constants` feature) and the PROD values everywhere else.

const MIB: u32 = 1024 * 1024;

/// Padding and block size distribution parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PaddingValues {
    /// Minimum Pareto padding size in bytes (scale `x_min`)
    pub pareto_min: u32,
    /// Maximum Pareto padding size in bytes (truncation point)
    pub pareto_max: u32,
    /// Pareto shape parameter
    pub pareto_alpha: f64,
    /// Minimum block size in bytes
    pub block_size_min: u32,
    /// Maximum block size in bytes
    pub block_size_max: u32,
    /// Target mean of the log-normal block size distribution
    pub block_size_mean: f64,
    /// Log-normal sigma parameter for block size distribution
    pub block_size_log_sigma: f64,
}

impl PaddingValues {
    /// Production values (5MB-600MB Pareto, 2MB-256MB blocks, mean block 35MB)
    pub const PROD: Self = Self {
        pareto_min: 5 * MIB,
        pareto_max: 600 * MIB,
        pareto_alpha: 1.25,
        block_size_min: 2 * MIB,
        block_size_max: 256 * MIB,
        block_size_mean: 35.0 * MIB as f64,
        block_size_log_sigma: 0.9,
    };

    /// Test values for fast tests (1KB-10KB)
    pub const TEST: Self = Self {
        pareto_min: 1024,
        pareto_max: 10 * 1024,
        pareto_alpha: 1.25,
        block_size_min: 1024,
        block_size_max: 10 * 1024,
        block_size_mean: 4096.0,
        block_size_log_sigma: 0.4,
    };

    /// Tiny values for unit tests (very fast)
    pub const TINY: Self = Self {
        pareto_min: 64,
        pareto_max: 256,
        pareto_alpha: 1.25,
        block_size_min: 128,
        block_size_max: 512,
        block_size_mean: 256.0,
        block_size_log_sigma: 0.3,
    };

    /// Log-normal mu such that the untruncated mean equals `block_size_mean`
    ///
    /// `mu = ln(mean) - sigma^2 / 2`
    #[must_use]
    pub fn block_size_log_mu(&self) -> f64 {
        let sigma = self.block_size_log_sigma;
        self.block_size_mean.ln() - sigma * sigma / 2.0
    }
}

impl Default for PaddingValues {
    fn default() -> Self {
        #[cfg(any(test, feature = "test-constants"))]
        { Self::TEST }
        #[cfg(not(any(test, feature = "test-constants")))]
        { Self::PROD }
    }
}

/// Argon2id cost parameters for the password KDF
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl KdfParams {
    /// Production cost: 32 MiB, 3 passes
    pub const PROD: Self = Self {
        memory_kib: 32 * 1024,
        iterations: 3,
        parallelism: 1,
    };

    /// Cheap cost for tests (64 KiB, single pass)
    pub const TEST: Self = Self {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };
}

impl Default for KdfParams {
    fn default() -> Self {
        #[cfg(any(test, feature = "test-constants"))]
        { Self::TEST }
        #[cfg(not(any(test, feature = "test-constants")))]
        { Self::PROD }
    }
}

/// Input limits enforced by the session facade
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Maximum password length in characters
    pub max_password_chars: usize,
    /// Maximum payload size in bytes
    pub max_payload_bytes: usize,
}

impl Limits {
    pub const DEFAULT: Self = Self {
        max_password_chars: 1000,
        max_payload_bytes: 100 * MIB as usize,
    };
}

impl Default for Limits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Storage configuration
#[derive(Clone, Copy, Debug, Default)]
pub struct StorageConfig {
    padding_values: PaddingValues,
    kdf_params: KdfParams,
    limits: Limits,
}

impl StorageConfig {
    /// Create config with default values for this build
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config with custom padding values
    pub fn with_padding(padding: PaddingValues) -> Self {
        Self {
            padding_values: padding,
            ..Self::default()
        }
    }

    /// Replace the password KDF cost
    #[must_use]
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf_params = kdf;
        self
    }

    /// Replace the input limits
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Get padding values
    pub fn padding(&self) -> &PaddingValues {
        &self.padding_values
    }

    /// Get password KDF parameters
    pub fn kdf(&self) -> &KdfParams {
        &self.kdf_params
    }

    /// Get input limits
    pub fn limits(&self) -> &Limits {
        &self.limits
    }
}
