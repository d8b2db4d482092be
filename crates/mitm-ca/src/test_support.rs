use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
};

use crate::issue::{IssuedIdentity, LeafSigner, RcgenLeafSigner};
use crate::root::RootAuthority;
use crate::CaError;

pub(crate) struct GeneratedRoot {
    pub(crate) cert_pem: String,
    pub(crate) key_pem: String,
    pub(crate) cert_der: Vec<u8>,
    pub(crate) key_der: Vec<u8>,
}

pub(crate) fn generate_root(common_name: &str) -> GeneratedRoot {
    let key = KeyPair::generate().expect("root key");
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    distinguished_name.push(DnType::OrganizationName, "mitm-ca tests");
    params.distinguished_name = distinguished_name;

    let cert = params.self_signed(&key).expect("self-signed root");
    GeneratedRoot {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        cert_der: cert.der().to_vec(),
        key_der: key.serialize_der(),
    }
}

/// Wraps a signer to count calls, optionally sleeping or failing for chosen hosts.
pub(crate) struct ScriptedSigner {
    inner: RcgenLeafSigner,
    calls: Arc<AtomicUsize>,
    slow_host: Option<(String, Duration)>,
    failing_host: Option<String>,
    panicking_host: Option<String>,
}

impl ScriptedSigner {
    pub(crate) fn new(inner: RcgenLeafSigner) -> Self {
        Self {
            inner,
            calls: Arc::new(AtomicUsize::new(0)),
            slow_host: None,
            failing_host: None,
            panicking_host: None,
        }
    }

    pub(crate) fn slow_for(mut self, host: &str, delay: Duration) -> Self {
        self.slow_host = Some((host.to_string(), delay));
        self
    }

    pub(crate) fn failing_for(mut self, host: &str) -> Self {
        self.failing_host = Some(host.to_string());
        self
    }

    pub(crate) fn panicking_for(mut self, host: &str) -> Self {
        self.panicking_host = Some(host.to_string());
        self
    }

    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl LeafSigner for ScriptedSigner {
    fn issue(&self, root: &RootAuthority, host: &str) -> Result<IssuedIdentity, CaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((slow_host, delay)) = &self.slow_host {
            if slow_host == host {
                std::thread::sleep(*delay);
            }
        }
        if self.panicking_host.as_deref() == Some(host) {
            panic!("scripted panic for {host}");
        }
        if self.failing_host.as_deref() == Some(host) {
            return Err(CaError::Signing(format!("scripted failure for {host}")));
        }
        self.inner.issue(root, host)
    }
}
