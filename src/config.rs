//! Verifier configuration.
//!
//! All operational knobs are externally supplied: queue concurrency, retry
//! policy, the registry RPC endpoint and the on-disk cache location. The
//! core never negotiates these.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::VerificationError;

/// Default RPC endpoint for registry reads.
pub const DEFAULT_RPC_URL: &str = "https://mainnet.base.org";
/// Default base URL image tarballs are derived from.
pub const DEFAULT_IMAGE_BASE_URL: &str =
    "https://github.com/Dstack-TEE/meta-dstack/releases/download";

fn default_worker_count() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_rpc_url() -> String {
    DEFAULT_RPC_URL.to_string()
}

fn default_image_base_url() -> String {
    DEFAULT_IMAGE_BASE_URL.to_string()
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("image-cache")
}

/// Configuration consumed by the verification engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Maximum number of jobs running simultaneously.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Maximum attempts for a job failing transiently.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay of the exponential backoff curve.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// JSON-RPC endpoint of the chain hosting the registry contract.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Address of the governance registry contract (0x-prefixed hex).
    #[serde(default)]
    pub registry_address: String,

    /// Root directory of the shared reference-image cache.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// Base URL reference-image download URLs are derived from.
    #[serde(default = "default_image_base_url")]
    pub image_base_url: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            rpc_url: default_rpc_url(),
            registry_address: String::new(),
            cache_root: default_cache_root(),
            image_base_url: default_image_base_url(),
        }
    }
}

impl VerifierConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), VerificationError> {
        if self.worker_count == 0 {
            return Err(VerificationError::Configuration(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(VerificationError::Configuration(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.registry_address.is_empty() {
            return Err(VerificationError::Configuration(
                "registry_address must be set".into(),
            ));
        }
        let address = self
            .registry_address
            .strip_prefix("0x")
            .unwrap_or(&self.registry_address);
        if address.len() != 40 || hex::decode(address).is_err() {
            return Err(VerificationError::Configuration(format!(
                "registry_address {:?} is not a 20-byte hex address",
                self.registry_address
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> VerifierConfig {
        VerifierConfig {
            registry_address: format!("0x{}", "ab".repeat(20)),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_deserialize() {
        let config: VerifierConfig =
            serde_json::from_str(&format!(r#"{{"registry_address": "0x{}"}}"#, "ab".repeat(20)))
                .unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base_ms, 500);
        assert_eq!(config.rpc_url, DEFAULT_RPC_URL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = VerifierConfig {
            worker_count: 0,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_registry_address() {
        for bad in ["", "0x1234", "not-an-address"] {
            let config = VerifierConfig {
                registry_address: bad.into(),
                ..valid()
            };
            assert!(config.validate().is_err(), "{bad:?} should be rejected");
        }
    }
}
