use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::authority::LeafCacheStatus;
use crate::cache::{CertificateCache, TrackedIdentity};
use crate::issue::LeafSigner;
use crate::metrics::AuthorityMetricsStore;
use crate::pool::{ObjectPool, Recycle};
use crate::root::RootAuthority;
use crate::CaError;

const HOST_CAPACITY_HINT: usize = 64;

pub(crate) type ShardSender = mpsc::UnboundedSender<Box<SignRequest>>;
pub(crate) type ShardReceiver = mpsc::UnboundedReceiver<Box<SignRequest>>;

/// Pooled request record. Travels requester -> worker -> requester.
pub(crate) struct SignRequest {
    pub(crate) host: String,
    reply_tx: mpsc::Sender<SignReply>,
}

/// Pooled response record, filled by the worker and drained by the requester.
pub(crate) struct SignResponse {
    identity: Option<TrackedIdentity>,
    error: Option<CaError>,
    cache_status: LeafCacheStatus,
}

impl SignResponse {
    pub(crate) fn new() -> Self {
        Self {
            identity: None,
            error: None,
            cache_status: LeafCacheStatus::Miss,
        }
    }

    pub(crate) fn take_result(&mut self) -> Result<(TrackedIdentity, LeafCacheStatus), CaError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        match self.identity.take() {
            Some(identity) => Ok((identity, self.cache_status)),
            None => Err(CaError::Signing(
                "signing worker replied without a certificate".to_string(),
            )),
        }
    }
}

impl Recycle for SignResponse {
    fn recycle(&mut self) {
        self.identity = None;
        self.error = None;
        self.cache_status = LeafCacheStatus::Miss;
    }
}

pub(crate) struct SignReply {
    pub(crate) request: Box<SignRequest>,
    pub(crate) response: Box<SignResponse>,
}

/// A request record plus the receiving end of its reply channel.
///
/// The channel has capacity one and outlives every checkout, so exactly one reply
/// is ever buffered and the worker's send never waits on the requester.
pub(crate) struct RequestSlot {
    pub(crate) request: Box<SignRequest>,
    pub(crate) replies: mpsc::Receiver<SignReply>,
}

impl RequestSlot {
    pub(crate) fn new() -> Self {
        let (reply_tx, replies) = mpsc::channel(1);
        Self {
            request: Box::new(SignRequest {
                host: String::with_capacity(HOST_CAPACITY_HINT),
                reply_tx,
            }),
            replies,
        }
    }
}

impl Recycle for RequestSlot {
    fn recycle(&mut self) {
        self.request.host.clear();
    }
}

pub(crate) struct WorkerContext {
    pub(crate) root: Arc<RootAuthority>,
    pub(crate) cache: Arc<CertificateCache>,
    pub(crate) signer: Arc<dyn LeafSigner>,
    pub(crate) responses: Arc<ObjectPool<Box<SignResponse>>>,
    pub(crate) metrics: Arc<AuthorityMetricsStore>,
    pub(crate) leaf_ttl: Duration,
}

impl WorkerContext {
    fn sign(&self, host: &str, response: &mut SignResponse) {
        if let Some(tracked) = self.cache.get(host) {
            self.metrics.record_cache_hit();
            response.identity = Some(tracked);
            response.cache_status = LeafCacheStatus::Hit;
            return;
        }

        self.metrics.record_cache_miss();
        match self.signer.issue(&self.root, host) {
            Ok(identity) => {
                let weight = identity.weight();
                let tracked = self
                    .cache
                    .set(host, Arc::new(identity), weight, self.leaf_ttl);
                self.metrics.record_leaf_issued();
                response.identity = Some(tracked);
                response.cache_status = LeafCacheStatus::Miss;
            }
            Err(error) => {
                self.metrics.record_signing_failure();
                tracing::warn!(host, %error, "leaf certificate signing failed");
                response.error = Some(error);
            }
        }
    }

    /// Runs [`WorkerContext::sign`] so that a panic fails only this request.
    fn sign_guarded(&self, shard: usize, host: &str, response: &mut SignResponse) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.sign(host, response)));
        if outcome.is_err() {
            self.metrics.record_signing_failure();
            tracing::warn!(shard, host, "signing panicked; request failed, worker continues");
            response.identity = None;
            response.error = Some(CaError::Signing(format!("signer panicked for {host}")));
        }
    }
}

pub(crate) fn spawn_worker(
    shard: usize,
    inbox: ShardReceiver,
    context: Arc<WorkerContext>,
) -> io::Result<JoinHandle<()>> {
    context.metrics.record_worker_start();
    let metrics = Arc::clone(&context.metrics);
    thread::Builder::new()
        .name(format!("mitm-ca-signer-{shard}"))
        .spawn(move || run_worker(shard, inbox, context))
        .inspect_err(|_| metrics.record_worker_exit())
}

fn run_worker(shard: usize, mut inbox: ShardReceiver, context: Arc<WorkerContext>) {
    tracing::debug!(shard, "signing worker started");
    // Returns None once every sender is dropped and the queue is drained.
    while let Some(request) = inbox.blocking_recv() {
        let mut response = context.responses.acquire();
        context.sign_guarded(shard, &request.host, &mut response);

        let reply_tx = request.reply_tx.clone();
        match reply_tx.try_send(SignReply { request, response }) {
            Ok(()) => {}
            Err(TrySendError::Closed(reply)) | Err(TrySendError::Full(reply)) => {
                context.metrics.record_abandoned_reply();
                tracing::debug!(
                    shard,
                    host = %reply.request.host,
                    "requester abandoned sign request; dropping reply"
                );
                context.responses.release(reply.response);
            }
        }
    }
    tracing::debug!(shard, "signing worker stopped");
    context.metrics.record_worker_exit();
}
