use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::OffsetDateTime;

use crate::config::{CertificateAuthorityConfig, LeafKeyAlgorithm};
use crate::root::RootAuthority;
use crate::CaError;

const CLOCK_SKEW_ALLOWANCE: time::Duration = time::Duration::minutes(5);

/// Produces a signed leaf identity for one hostname.
///
/// Called from a signing worker's thread, one call at a time per shard.
pub trait LeafSigner: Send + Sync {
    fn issue(&self, root: &RootAuthority, host: &str) -> Result<IssuedIdentity, CaError>;
}

/// A leaf certificate, its private key and the server config wrapping both.
///
/// Immutable once built; shared through `Arc` by the cache and every caller.
pub struct IssuedIdentity {
    host: String,
    leaf_cert_der: CertificateDer<'static>,
    leaf_key_der: PrivatePkcs8KeyDer<'static>,
    server_config: Arc<ServerConfig>,
    not_after: OffsetDateTime,
    weight: u64,
}

impl IssuedIdentity {
    pub fn from_parts(
        host: &str,
        leaf_cert_der: CertificateDer<'static>,
        leaf_key_der: PrivatePkcs8KeyDer<'static>,
        not_after: OffsetDateTime,
        root: &RootAuthority,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Self, CaError> {
        let chain = vec![leaf_cert_der.clone(), root.certificate_der().clone()];
        let private_key = PrivateKeyDer::from(leaf_key_der.clone_key());

        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)?;
        server_config.alpn_protocols = alpn_protocols;

        let weight = (leaf_cert_der.len()
            + leaf_key_der.secret_pkcs8_der().len()
            + root.certificate_der().len()) as u64;

        Ok(Self {
            host: host.to_string(),
            leaf_cert_der,
            leaf_key_der,
            server_config: Arc::new(server_config),
            not_after,
            weight,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn leaf_cert_der(&self) -> &CertificateDer<'static> {
        &self.leaf_cert_der
    }

    pub fn leaf_key_der(&self) -> &PrivatePkcs8KeyDer<'static> {
        &self.leaf_key_der
    }

    pub fn server_config(&self) -> &Arc<ServerConfig> {
        &self.server_config
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Bytes charged against the cache byte budget: leaf, key and root DER.
    pub fn weight(&self) -> u64 {
        self.weight
    }
}

impl fmt::Debug for IssuedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedIdentity")
            .field("host", &self.host)
            .field("leaf_cert_len", &self.leaf_cert_der.len())
            .field("not_after", &self.not_after)
            .field("alpn", &self.server_config.alpn_protocols)
            .finish_non_exhaustive()
    }
}

/// Default signer: a fresh key pair per leaf, signed by the root with `rcgen`.
#[derive(Debug, Clone)]
pub struct RcgenLeafSigner {
    key_algorithm: LeafKeyAlgorithm,
    validity: time::Duration,
    alpn_protocols: Vec<Vec<u8>>,
}

impl RcgenLeafSigner {
    pub fn from_config(config: &CertificateAuthorityConfig) -> Self {
        let validity_seconds = i64::try_from(config.leaf_validity_seconds()).unwrap_or(i64::MAX);
        Self {
            key_algorithm: config.leaf_key_algorithm,
            validity: time::Duration::seconds(validity_seconds),
            alpn_protocols: config.alpn_protocols(),
        }
    }
}

impl LeafSigner for RcgenLeafSigner {
    fn issue(&self, root: &RootAuthority, host: &str) -> Result<IssuedIdentity, CaError> {
        let now = OffsetDateTime::now_utc();
        let not_after = now.checked_add(self.validity).ok_or_else(|| {
            CaError::Signing(format!("leaf validity overflows the clock for {host}"))
        })?;
        let leaf_params = leaf_template(host, now - CLOCK_SKEW_ALLOWANCE, not_after)?;

        let leaf_key = KeyPair::generate_for(self.key_algorithm.signature_algorithm())?;
        let leaf_cert = leaf_params.signed_by(&leaf_key, root.issuer())?;
        let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());

        IssuedIdentity::from_parts(
            host,
            leaf_cert.der().clone(),
            leaf_key_der,
            not_after,
            root,
            self.alpn_protocols.clone(),
        )
    }
}

/// Server-auth leaf naming `host` in both the subject CN and a single SAN.
fn leaf_template(
    host: &str,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<CertificateParams, CaError> {
    let mut subject = DistinguishedName::new();
    subject.push(DnType::CommonName, host.to_string());

    let mut params = CertificateParams::default();
    params.distinguished_name = subject;
    params.subject_alt_names = vec![subject_alt_name(host)?];
    params.not_before = not_before;
    params.not_after = not_after;
    params.is_ca = IsCa::NoCa;
    // Every supported leaf key signs; none encipher.
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;
    Ok(params)
}

fn subject_alt_name(host: &str) -> Result<SanType, CaError> {
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(SanType::IpAddress(ip)),
        Err(_) => Ok(SanType::DnsName(host.try_into()?)),
    }
}
