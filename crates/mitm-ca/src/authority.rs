use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

use crate::cache::{CertificateCache, TrackedIdentity};
use crate::config::CertificateAuthorityConfig;
use crate::issue::{IssuedIdentity, LeafSigner, RcgenLeafSigner};
use crate::metrics::{AuthorityMetrics, AuthorityMetricsStore};
use crate::pool::ObjectPool;
use crate::root::RootAuthority;
use crate::shard::ShardHasher;
use crate::worker::{
    spawn_worker, RequestSlot, ShardSender, SignReply, SignResponse, WorkerContext,
};
use crate::CaError;

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
}

impl LeafCacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

/// Server config for one hostname, pinned in the certificate cache while held.
#[derive(Debug, Clone)]
pub struct IssuedServerConfig {
    pub server_config: Arc<ServerConfig>,
    pub cache_status: LeafCacheStatus,
    identity: TrackedIdentity,
}

impl IssuedServerConfig {
    fn new(identity: TrackedIdentity, cache_status: LeafCacheStatus) -> Self {
        Self {
            server_config: Arc::clone(identity.server_config()),
            cache_status,
            identity,
        }
    }

    pub fn identity(&self) -> &Arc<IssuedIdentity> {
        self.identity.value()
    }

    pub fn leaf_cert_der(&self) -> &CertificateDer<'static> {
        self.identity.leaf_cert_der()
    }

    pub fn leaf_key_der(&self) -> &PrivatePkcs8KeyDer<'static> {
        self.identity.leaf_key_der()
    }

    /// True when both configs wrap the very same issued certificate and key.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.identity.ptr_eq(&other.identity)
    }
}

/// Issues and caches per-host leaf certificates signed by one root.
///
/// Every hostname is routed to a fixed signing worker (`fnv1a(host) % workers`),
/// so concurrent requests for one host are served by a single signing operation
/// while different hosts are signed in parallel. Unrelated hosts that land on the
/// same shard are serialized behind each other.
pub struct CertificateAuthority {
    root: Arc<RootAuthority>,
    cache: Arc<CertificateCache>,
    shards: RwLock<Option<Vec<ShardSender>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    requests: ObjectPool<RequestSlot>,
    responses: Arc<ObjectPool<Box<SignResponse>>>,
    hashers: ObjectPool<ShardHasher>,
    metrics: Arc<AuthorityMetricsStore>,
}

impl CertificateAuthority {
    pub fn new(
        root_cert: &[u8],
        root_key: &[u8],
        config: CertificateAuthorityConfig,
    ) -> Result<Self, CaError> {
        let signer = Arc::new(RcgenLeafSigner::from_config(&config));
        Self::with_signer(root_cert, root_key, config, signer)
    }

    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        config: CertificateAuthorityConfig,
    ) -> Result<Self, CaError> {
        let cert = std::fs::read(cert_path.as_ref())?;
        let key = std::fs::read(key_path.as_ref())?;
        Self::new(&cert, &key, config)
    }

    pub fn with_signer(
        root_cert: &[u8],
        root_key: &[u8],
        config: CertificateAuthorityConfig,
        signer: Arc<dyn LeafSigner>,
    ) -> Result<Self, CaError> {
        config.validate()?;
        let root = Arc::new(RootAuthority::parse(root_cert, root_key)?);
        let cache = Arc::new(CertificateCache::new(
            config.cache_max_items,
            config.cache_max_bytes,
        ));
        let responses = Arc::new(ObjectPool::new(config.pool_max_idle, || {
            Box::new(SignResponse::new())
        }));
        let metrics = Arc::new(AuthorityMetricsStore::default());

        let context = Arc::new(WorkerContext {
            root: Arc::clone(&root),
            cache: Arc::clone(&cache),
            signer,
            responses: Arc::clone(&responses),
            metrics: Arc::clone(&metrics),
            leaf_ttl: config.leaf_ttl(),
        });

        let mut senders = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);
        for shard in 0..config.workers {
            let (sender, inbox) = mpsc::unbounded_channel();
            match spawn_worker(shard, inbox, Arc::clone(&context)) {
                Ok(handle) => {
                    senders.push(sender);
                    handles.push(handle);
                }
                Err(error) => {
                    drop(senders);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(CaError::Io(error));
                }
            }
        }

        tracing::info!(
            workers = config.workers,
            cache_max_items = config.cache_max_items,
            cache_max_bytes = config.cache_max_bytes,
            root = root.common_name().unwrap_or("<unnamed>"),
            "certificate authority started"
        );

        Ok(Self {
            root,
            cache,
            shards: RwLock::new(Some(senders)),
            workers: Mutex::new(handles),
            worker_count: config.workers,
            requests: ObjectPool::new(config.pool_max_idle, RequestSlot::new),
            responses,
            hashers: ObjectPool::new(config.pool_max_idle, ShardHasher::default),
            metrics,
        })
    }

    /// Returns the server config for `host`, signing a new leaf on a cache miss.
    ///
    /// There is no built-in timeout. Dropping the future abandons the request; the
    /// worker still finishes signing and caches the result.
    pub async fn get(&self, host: &str) -> Result<IssuedServerConfig, CaError> {
        let mut replies = self.submit(host)?;
        let reply = replies.recv().await;
        self.complete(replies, reply)
    }

    /// Blocking variant of [`CertificateAuthority::get`] for synchronous callers.
    ///
    /// Panics if called from within an async runtime.
    pub fn get_blocking(&self, host: &str) -> Result<IssuedServerConfig, CaError> {
        let mut replies = self.submit(host)?;
        let reply = replies.blocking_recv();
        self.complete(replies, reply)
    }

    /// Stops accepting requests, drains every worker queue and joins the workers.
    pub fn close(&self) {
        let mut workers = self.workers.lock();
        let Some(senders) = self.shards.write().take() else {
            return;
        };
        drop(senders);
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("signing worker exited with a panic");
            }
        }
        tracing::info!("certificate authority closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shards.read().is_none()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Shard index the normalized form of `host` is routed to.
    pub fn shard_for(&self, host: &str) -> Result<usize, CaError> {
        let mut normalized = String::with_capacity(host.len());
        write_normalized_host(&mut normalized, validate_host(host)?);
        Ok(self.shard_index(&normalized))
    }

    pub fn root(&self) -> &RootAuthority {
        &self.root
    }

    pub fn root_certificate_der(&self) -> &CertificateDer<'static> {
        self.root.certificate_der()
    }

    pub fn root_certificate_pem(&self) -> String {
        self.root.certificate_pem()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn metrics_snapshot(&self) -> AuthorityMetrics {
        let requests = self.requests.stats();
        AuthorityMetrics {
            cache_evictions: self.cache.evictions(),
            pooled_requests_allocated: requests.allocated,
            pooled_requests_reused: requests.reused,
            pooled_requests_dropped: requests.dropped,
            ..self.metrics.snapshot()
        }
    }

    fn shard_index(&self, normalized_host: &str) -> usize {
        let mut hasher = self.hashers.acquire();
        let shard = hasher.shard_of(normalized_host, self.worker_count);
        self.hashers.release(hasher);
        shard
    }

    fn submit(&self, host: &str) -> Result<mpsc::Receiver<SignReply>, CaError> {
        let host = validate_host(host)?;
        let RequestSlot {
            mut request,
            replies,
        } = self.requests.acquire();
        write_normalized_host(&mut request.host, host);
        let shard = self.shard_index(&request.host);

        let shards = self.shards.read();
        let Some(senders) = shards.as_ref() else {
            self.requests.release(RequestSlot { request, replies });
            return Err(CaError::Closed);
        };
        if let Err(SendError(request)) = senders[shard].send(request) {
            self.requests.release(RequestSlot { request, replies });
            return Err(worker_gone(shard));
        }
        Ok(replies)
    }

    fn complete(
        &self,
        replies: mpsc::Receiver<SignReply>,
        reply: Option<SignReply>,
    ) -> Result<IssuedServerConfig, CaError> {
        // No reply means the queue was torn down with the request still in it.
        let Some(SignReply {
            request,
            mut response,
        }) = reply
        else {
            if self.is_closed() {
                return Err(CaError::Closed);
            }
            return Err(CaError::Signing(
                "signing worker exited before replying".to_string(),
            ));
        };
        let result = response.take_result();
        self.responses.release(response);
        self.requests.release(RequestSlot { request, replies });

        let (identity, cache_status) = result?;
        Ok(IssuedServerConfig::new(identity, cache_status))
    }
}

impl Drop for CertificateAuthority {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_gone(shard: usize) -> CaError {
    tracing::error!(shard, "signing worker is no longer running");
    CaError::Signing(format!("signing worker for shard {shard} has exited"))
}

fn validate_host(host: &str) -> Result<&str, CaError> {
    let trimmed = host.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(CaError::InvalidInput(
            "hostname must not be empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_HOSTNAME_LEN {
        return Err(CaError::InvalidInput(format!(
            "hostname exceeds {MAX_HOSTNAME_LEN} bytes"
        )));
    }
    if trimmed.parse::<IpAddr>().is_ok() {
        return Ok(trimmed);
    }
    let name = trimmed.strip_prefix("*.").unwrap_or(trimmed);
    if !name.split('.').all(is_dns_label) {
        return Err(CaError::InvalidInput(format!(
            "hostname is neither a DNS name nor an IP literal: {trimmed:?}"
        )));
    }
    Ok(trimmed)
}

fn is_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-')
}

fn write_normalized_host(buffer: &mut String, host: &str) {
    buffer.clear();
    buffer.push_str(host);
    buffer.make_ascii_lowercase();
}

#[cfg(test)]
mod host_tests {
    use super::{validate_host, write_normalized_host};
    use crate::CaError;

    #[test]
    fn normalizes_case_whitespace_and_trailing_dot() {
        let mut buffer = String::new();
        write_normalized_host(&mut buffer, validate_host("  API.Example.COM. ").expect("valid"));
        assert_eq!(buffer, "api.example.com");
    }

    #[test]
    fn keeps_ip_literals_parseable() {
        let mut buffer = String::new();
        write_normalized_host(&mut buffer, validate_host("2001:DB8::1").expect("valid"));
        assert!(buffer.parse::<std::net::IpAddr>().is_ok());
    }

    #[test]
    fn accepts_dns_names_wildcards_and_ip_literals() {
        for host in [
            "api.example.com",
            "xn--bcher-kva.example",
            "*.example.com",
            "localhost",
            "10.0.0.1",
            "::1",
        ] {
            assert_eq!(validate_host(host).expect("valid host"), host);
        }
    }

    #[test]
    fn rejects_empty_and_malformed_hosts() {
        for host in [
            "",
            "   ",
            ".",
            "bad host.example.com",
            "tab\thost",
            "bücher.example",
            "foo/bar",
            "evil.com:443",
            "x@y",
            "a..b",
            "[::1]",
            "-leading.example.com",
            "trailing-.example.com",
            "api.*.example.com",
        ] {
            match validate_host(host) {
                Err(CaError::InvalidInput(_)) => {}
                other => panic!("expected invalid input for {host:?}, got {other:?}"),
            }
        }
        let too_long = "a".repeat(254);
        assert!(validate_host(&too_long).is_err());
        let long_label = format!("{}.example.com", "a".repeat(64));
        assert!(validate_host(&long_label).is_err());
    }
}
