use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CaError;

pub const DEFAULT_POOL_MAX_IDLE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafKeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Ed25519,
}

impl Default for LeafKeyAlgorithm {
    fn default() -> Self {
        Self::EcdsaP256
    }
}

impl LeafKeyAlgorithm {
    pub(crate) fn signature_algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }
}

/// Budgets, sharding and leaf policy for a [`crate::CertificateAuthority`].
///
/// Worker count and TTL have no defaults; callers decide both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateAuthorityConfig {
    pub cache_max_bytes: u64,
    pub cache_max_items: usize,
    pub workers: usize,
    pub leaf_ttl_seconds: u64,
    #[serde(default)]
    pub leaf_validity_seconds: Option<u64>,
    #[serde(default)]
    pub leaf_key_algorithm: LeafKeyAlgorithm,
    #[serde(default)]
    pub http2_enabled: bool,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,
}

fn default_pool_max_idle() -> usize {
    DEFAULT_POOL_MAX_IDLE
}

impl CertificateAuthorityConfig {
    pub fn new(
        cache_max_bytes: u64,
        cache_max_items: usize,
        workers: usize,
        leaf_ttl_seconds: u64,
    ) -> Self {
        Self {
            cache_max_bytes,
            cache_max_items,
            workers,
            leaf_ttl_seconds,
            leaf_validity_seconds: None,
            leaf_key_algorithm: LeafKeyAlgorithm::default(),
            http2_enabled: false,
            pool_max_idle: DEFAULT_POOL_MAX_IDLE,
        }
    }

    pub fn with_available_parallelism(mut self) -> Self {
        self.workers = std::thread::available_parallelism()
            .map(|parallelism| parallelism.get())
            .unwrap_or(1);
        self
    }

    pub fn validate(&self) -> Result<(), CaError> {
        if self.workers == 0 {
            return Err(CaError::InvalidConfig(
                "workers must be greater than zero".to_string(),
            ));
        }
        if self.cache_max_items == 0 {
            return Err(CaError::InvalidConfig(
                "cache_max_items must be greater than zero".to_string(),
            ));
        }
        if self.cache_max_bytes == 0 {
            return Err(CaError::InvalidConfig(
                "cache_max_bytes must be greater than zero".to_string(),
            ));
        }
        if self.leaf_ttl_seconds == 0 {
            return Err(CaError::InvalidConfig(
                "leaf_ttl_seconds must be greater than zero".to_string(),
            ));
        }
        if let Some(validity) = self.leaf_validity_seconds {
            if validity < self.leaf_ttl_seconds {
                return Err(CaError::InvalidConfig(format!(
                    "leaf_validity_seconds ({validity}) must not be shorter than leaf_ttl_seconds ({})",
                    self.leaf_ttl_seconds
                )));
            }
        }
        if i64::try_from(self.leaf_validity_seconds()).is_err() {
            return Err(CaError::InvalidConfig(
                "leaf_validity_seconds is out of range".to_string(),
            ));
        }
        if self.pool_max_idle == 0 {
            return Err(CaError::InvalidConfig(
                "pool_max_idle must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn leaf_ttl(&self) -> Duration {
        Duration::from_secs(self.leaf_ttl_seconds)
    }

    pub fn leaf_validity_seconds(&self) -> u64 {
        self.leaf_validity_seconds.unwrap_or(self.leaf_ttl_seconds)
    }

    pub(crate) fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        if self.http2_enabled {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CertificateAuthorityConfig, LeafKeyAlgorithm, DEFAULT_POOL_MAX_IDLE};
    use crate::CaError;

    #[test]
    fn minimal_config_is_valid() {
        let config = CertificateAuthorityConfig::new(1 << 20, 100, 4, 3_600);
        config.validate().expect("minimal config should validate");
        assert_eq!(config.leaf_validity_seconds(), 3_600);
        assert_eq!(config.alpn_protocols(), vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn rejects_zero_workers_and_budgets() {
        let cases = [
            (
                CertificateAuthorityConfig::new(1 << 20, 100, 0, 3_600),
                "workers",
            ),
            (
                CertificateAuthorityConfig::new(1 << 20, 0, 4, 3_600),
                "cache_max_items",
            ),
            (
                CertificateAuthorityConfig::new(0, 100, 4, 3_600),
                "cache_max_bytes",
            ),
            (
                CertificateAuthorityConfig::new(1 << 20, 100, 4, 0),
                "leaf_ttl_seconds",
            ),
        ];
        for (config, field) in cases {
            match config.validate() {
                Err(CaError::InvalidConfig(detail)) => {
                    assert!(detail.contains(field), "{detail}");
                }
                other => panic!("expected invalid config for {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_validity_shorter_than_ttl() {
        let config = CertificateAuthorityConfig {
            leaf_validity_seconds: Some(60),
            ..CertificateAuthorityConfig::new(1 << 20, 100, 4, 3_600)
        };
        let error = config.validate().expect_err("validity below ttl must fail");
        assert!(error.to_string().contains("leaf_validity_seconds"), "{error}");
    }

    #[test]
    fn available_parallelism_yields_at_least_one_worker() {
        let config = CertificateAuthorityConfig::new(1 << 20, 100, 0, 3_600)
            .with_available_parallelism();
        assert!(config.workers >= 1);
        config.validate().expect("derived worker count should validate");
    }

    #[test]
    fn http2_enables_h2_alpn_first() {
        let config = CertificateAuthorityConfig {
            http2_enabled: true,
            ..CertificateAuthorityConfig::new(1 << 20, 100, 4, 3_600)
        };
        assert_eq!(
            config.alpn_protocols(),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn serde_fills_optional_fields() {
        let json = r#"
            {
              "cache_max_bytes": 1048576,
              "cache_max_items": 512,
              "workers": 8,
              "leaf_ttl_seconds": 86400,
              "leaf_key_algorithm": "ed25519"
            }
        "#;
        let parsed =
            serde_json::from_str::<CertificateAuthorityConfig>(json).expect("deserialize config");
        assert_eq!(parsed.workers, 8);
        assert_eq!(parsed.cache_max_items, 512);
        assert_eq!(parsed.leaf_key_algorithm, LeafKeyAlgorithm::Ed25519);
        assert_eq!(parsed.leaf_validity_seconds, None);
        assert!(!parsed.http2_enabled);
        assert_eq!(parsed.pool_max_idle, DEFAULT_POOL_MAX_IDLE);
        parsed.validate().expect("parsed config should validate");
    }

    #[test]
    fn serde_requires_worker_count_and_ttl() {
        let json = r#"{ "cache_max_bytes": 1048576, "cache_max_items": 512 }"#;
        assert!(serde_json::from_str::<CertificateAuthorityConfig>(json).is_err());
    }
}
