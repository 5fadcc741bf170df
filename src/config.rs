//! Allocator configuration
//!
//! [`AllocatorConfig`] controls how much of the device's free memory the
//! allocator is willing to take on a fresh allocation and which eviction
//! policy ranks resident objects under memory pressure.

use serde::{Deserialize, Serialize};

use crate::error::{DeviceMemoryError, DeviceMemoryResult};
use crate::memory::EvictionPolicy;

/// Environment variable overriding the utilization factor
pub const UTILIZATION_ENV: &str = "DEVCACHE_GPU_UTILIZATION";

/// Environment variable overriding the eviction policy
pub const EVICTION_POLICY_ENV: &str = "DEVCACHE_EVICTION_POLICY";

pub const DEFAULT_UTILIZATION_FACTOR: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Fraction of the device's reported free memory usable for a fresh
    /// allocation, in (0, 1]
    pub utilization_factor: f64,

    /// Ranking used to pick eviction victims
    pub eviction_policy: EvictionPolicy,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            utilization_factor: DEFAULT_UTILIZATION_FACTOR,
            eviction_policy: EvictionPolicy::default(),
        }
    }
}

impl AllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the utilization factor
    pub fn with_utilization_factor(mut self, utilization_factor: f64) -> Self {
        self.utilization_factor = utilization_factor;
        self
    }

    /// Set the eviction policy
    pub fn with_eviction_policy(mut self, eviction_policy: EvictionPolicy) -> Self {
        self.eviction_policy = eviction_policy;
        self
    }

    pub fn validate(&self) -> DeviceMemoryResult<()> {
        let factor = self.utilization_factor;
        if !factor.is_finite() || factor <= 0.0 || factor > 1.0 {
            return Err(DeviceMemoryError::InvalidArgument(format!(
                "utilization factor must be in (0, 1], got {}",
                factor
            )));
        }
        Ok(())
    }

    /// Defaults overridden by `DEVCACHE_GPU_UTILIZATION` and
    /// `DEVCACHE_EVICTION_POLICY`
    pub fn from_env() -> DeviceMemoryResult<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(UTILIZATION_ENV) {
            config.utilization_factor = value.trim().parse().map_err(|_| {
                DeviceMemoryError::InvalidArgument(format!(
                    "{} must be a number, got {:?}",
                    UTILIZATION_ENV, value
                ))
            })?;
        }

        if let Ok(value) = std::env::var(EVICTION_POLICY_ENV) {
            config.eviction_policy = EvictionPolicy::from_str(&value).ok_or_else(|| {
                DeviceMemoryError::InvalidArgument(format!(
                    "{} must be size_aware or recency, got {:?}",
                    EVICTION_POLICY_ENV, value
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Bytes a fresh allocation may take given the device's free memory
    pub fn usable(&self, device_free: usize) -> usize {
        (device_free as f64 * self.utilization_factor).floor() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var(UTILIZATION_ENV);
        std::env::remove_var(EVICTION_POLICY_ENV);
    }

    #[test]
    fn test_defaults() {
        let config = AllocatorConfig::default();
        assert_eq!(config.utilization_factor, 0.9);
        assert_eq!(config.eviction_policy, EvictionPolicy::SizeAware);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = AllocatorConfig::new()
            .with_utilization_factor(0.5)
            .with_eviction_policy(EvictionPolicy::Recency);
        assert_eq!(config.utilization_factor, 0.5);
        assert_eq!(config.eviction_policy, EvictionPolicy::Recency);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        for factor in [0.0, -0.1, 1.01, f64::NAN, f64::INFINITY] {
            let config = AllocatorConfig::new().with_utilization_factor(factor);
            assert!(config.validate().unwrap_err().is_user_error(), "{}", factor);
        }
        assert!(AllocatorConfig::new()
            .with_utilization_factor(1.0)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_usable_floors() {
        let config = AllocatorConfig::default();
        assert_eq!(config.usable(1000), 900);
        assert_eq!(config.usable(999), 899);
        assert_eq!(config.usable(0), 0);
    }

    #[test]
    fn test_serde_fills_missing_fields() {
        let config: AllocatorConfig =
            serde_json::from_str(r#"{"eviction_policy":"recency"}"#).unwrap();
        assert_eq!(config.utilization_factor, DEFAULT_UTILIZATION_FACTOR);
        assert_eq!(config.eviction_policy, EvictionPolicy::Recency);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var(UTILIZATION_ENV, "0.75");
        std::env::set_var(EVICTION_POLICY_ENV, "lru");

        let config = AllocatorConfig::from_env().unwrap();
        assert_eq!(config.utilization_factor, 0.75);
        assert_eq!(config.eviction_policy, EvictionPolicy::Recency);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        std::env::set_var(UTILIZATION_ENV, "most of it");
        assert!(AllocatorConfig::from_env().is_err());

        std::env::set_var(UTILIZATION_ENV, "1.5");
        assert!(AllocatorConfig::from_env().is_err());

        clear_env();
        std::env::set_var(EVICTION_POLICY_ENV, "random");
        assert!(AllocatorConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_without_variables() {
        clear_env();
        assert_eq!(AllocatorConfig::from_env().unwrap(), AllocatorConfig::default());
    }
}
