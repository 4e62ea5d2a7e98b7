//! Cache configuration, loaded from environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// TTL policy for both cache namespaces (wrapped and unwrapped material).
///
/// Expiration is absolute from the time of write, never sliding.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheOptions {
    /// Minutes until a cache entry written now expires.
    #[serde(default = "default_absolute_expiration_mins")]
    pub absolute_expiration_mins: u64,
}

fn default_absolute_expiration_mins() -> u64 {
    30
}

impl CacheOptions {
    /// Load from `CACHE_*` environment variables (e.g.
    /// `CACHE_ABSOLUTE_EXPIRATION_MINS`), falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed, or if
    /// the configured expiration is zero.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix("CACHE"))
            .build()
            .context("failed to build cache configuration from environment")?;

        let c: CacheOptions = cfg
            .try_deserialize()
            .context("failed to deserialise cache configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.absolute_expiration_mins == 0 {
            anyhow::bail!("CACHE_ABSOLUTE_EXPIRATION_MINS must be > 0");
        }
        Ok(())
    }

    /// The configured expiration as a [`Duration`], saturating rather than
    /// overflowing on absurd configured values.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.absolute_expiration_mins.saturating_mul(60))
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            absolute_expiration_mins: default_absolute_expiration_mins(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_thirty_minutes() {
        let opts = CacheOptions::default();
        assert_eq!(opts.absolute_expiration_mins, 30);
        assert_eq!(opts.ttl(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn ttl_saturates_on_huge_expiration() {
        let opts = CacheOptions {
            absolute_expiration_mins: u64::MAX,
        };
        assert_eq!(opts.ttl(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn validate_rejects_zero_expiration() {
        let opts = CacheOptions {
            absolute_expiration_mins: 0,
        };
        assert!(opts.validate().is_err());
    }
}
