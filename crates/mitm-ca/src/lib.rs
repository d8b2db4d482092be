mod authority;
mod cache;
mod config;
mod error;
mod issue;
mod metrics;
mod pool;
mod root;
mod shard;
mod worker;

#[cfg(test)]
mod test_support;

pub use authority::{CertificateAuthority, IssuedServerConfig, LeafCacheStatus};
pub use cache::{BoundedCache, CertificateCache, Tracked, TrackedIdentity};
pub use config::{CertificateAuthorityConfig, LeafKeyAlgorithm, DEFAULT_POOL_MAX_IDLE};
pub use error::CaError;
pub use issue::{IssuedIdentity, LeafSigner, RcgenLeafSigner};
pub use metrics::AuthorityMetrics;
pub use root::RootAuthority;
pub use shard::ShardHasher;

#[cfg(test)]
mod tests {
    include!("tests_authority.rs");
    include!("tests_leaf_certificates.rs");
}
