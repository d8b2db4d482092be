use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::test_support::{generate_root, GeneratedRoot, ScriptedSigner};
use crate::{
    CaError, CertificateAuthority, CertificateAuthorityConfig, LeafCacheStatus, RcgenLeafSigner,
};

fn test_config(workers: usize) -> CertificateAuthorityConfig {
    CertificateAuthorityConfig::new(1 << 20, 1_000, workers, 3_600)
}

fn scripted_authority(
    root: &GeneratedRoot,
    config: CertificateAuthorityConfig,
    signer: ScriptedSigner,
) -> CertificateAuthority {
    CertificateAuthority::with_signer(
        root.cert_pem.as_bytes(),
        root.key_pem.as_bytes(),
        config,
        Arc::new(signer),
    )
    .expect("authority")
}

fn scripted_signer(config: &CertificateAuthorityConfig) -> ScriptedSigner {
    ScriptedSigner::new(RcgenLeafSigner::from_config(config))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_get_reuses_cached_identity() {
    let root = generate_root("double-get.mitm-ca");
    let authority = CertificateAuthority::new(
        root.cert_pem.as_bytes(),
        root.key_pem.as_bytes(),
        test_config(4),
    )
    .expect("authority");

    let first = authority.get("api.example.com").await.expect("first leaf");
    let second = authority.get("api.example.com").await.expect("second leaf");

    assert_eq!(first.cache_status, LeafCacheStatus::Miss);
    assert_eq!(second.cache_status, LeafCacheStatus::Hit);
    assert!(first.same_identity(&second));
    assert!(Arc::ptr_eq(&first.server_config, &second.server_config));
    assert_eq!(first.leaf_cert_der(), second.leaf_cert_der());
    assert_eq!(
        first.leaf_key_der().secret_pkcs8_der(),
        second.leaf_key_der().secret_pkcs8_der()
    );

    let metrics = authority.metrics_snapshot();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.cache_misses, 1);
    assert_eq!(metrics.leaves_issued, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hostname_case_and_trailing_dot_share_one_entry() {
    let root = generate_root("normalize.mitm-ca");
    let authority = CertificateAuthority::new(
        root.cert_pem.as_bytes(),
        root.key_pem.as_bytes(),
        test_config(4),
    )
    .expect("authority");

    let lower = authority.get("api.example.com").await.expect("lower");
    let mixed = authority.get("API.Example.com.").await.expect("mixed");
    assert!(lower.same_identity(&mixed));
    assert_eq!(mixed.identity().host(), "api.example.com");
    assert_eq!(authority.cached_entries(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gets_for_one_host_sign_once() {
    let root = generate_root("single-flight.mitm-ca");
    let config = test_config(4);
    let signer =
        scripted_signer(&config).slow_for("api.example.com", Duration::from_millis(100));
    let calls = signer.calls();
    let authority = Arc::new(scripted_authority(&root, config, signer));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let authority = Arc::clone(&authority);
            tokio::spawn(async move { authority.get("api.example.com").await })
        })
        .collect();

    let mut issued = Vec::with_capacity(tasks.len());
    for task in tasks {
        issued.push(task.await.expect("join").expect("leaf"));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let first = &issued[0];
    assert!(issued.iter().all(|leaf| leaf.same_identity(first)));
    assert_eq!(
        issued
            .iter()
            .filter(|leaf| leaf.cache_status == LeafCacheStatus::Miss)
            .count(),
        1
    );
    assert_eq!(authority.metrics_snapshot().leaves_issued, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_signing_does_not_block_other_shards() {
    let root = generate_root("parallel.mitm-ca");
    let config = test_config(4);
    let signer =
        scripted_signer(&config).slow_for("slow.example.com", Duration::from_millis(2_000));
    let authority = Arc::new(scripted_authority(&root, config, signer));

    let slow_shard = authority.shard_for("slow.example.com").expect("slow shard");
    let fast_host = (0..64)
        .map(|index| format!("fast-{index}.example.com"))
        .find(|host| authority.shard_for(host).expect("shard") != slow_shard)
        .expect("a host on another shard");

    let slow = tokio::spawn({
        let authority = Arc::clone(&authority);
        async move { authority.get("slow.example.com").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let fast = authority.get(&fast_host).await.expect("fast leaf");
    assert!(
        started.elapsed() < Duration::from_millis(1_000),
        "fast host waited {:?} behind a slow shard",
        started.elapsed()
    );
    assert_eq!(fast.cache_status, LeafCacheStatus::Miss);
    assert!(!slow.is_finished());

    let slow = slow.await.expect("join").expect("slow leaf");
    assert_eq!(slow.identity().host(), "slow.example.com");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn signing_failures_are_returned_and_never_cached() {
    let root = generate_root("failure.mitm-ca");
    let config = test_config(2);
    let signer = scripted_signer(&config).failing_for("broken.example.com");
    let calls = signer.calls();
    let authority = scripted_authority(&root, config, signer);

    for _ in 0..2 {
        match authority.get("broken.example.com").await {
            Err(CaError::Signing(detail)) => assert!(detail.contains("broken.example.com")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("scripted failure unexpectedly produced a leaf"),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2, "failures must be retried");
    assert_eq!(authority.cached_entries(), 0);

    let healthy = authority.get("api.example.com").await.expect("healthy leaf");
    assert_eq!(healthy.cache_status, LeafCacheStatus::Miss);

    let metrics = authority.metrics_snapshot();
    assert_eq!(metrics.signing_failures, 2);
    assert_eq!(metrics.leaves_issued, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panic_during_signing_fails_one_request_and_keeps_the_shard_alive() {
    let root = generate_root("panic.mitm-ca");
    let config = test_config(1);
    let signer = scripted_signer(&config).panicking_for("boom.example.com");
    let authority = scripted_authority(&root, config, signer);

    match authority.get("boom.example.com").await {
        Err(CaError::Signing(detail)) => assert!(detail.contains("boom.example.com")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("panicking signer unexpectedly produced a leaf"),
    }
    assert!(!authority.is_closed());

    let same_shard = authority.get("calm.example.com").await.expect("leaf after panic");
    assert_eq!(same_shard.cache_status, LeafCacheStatus::Miss);
    let metrics = authority.metrics_snapshot();
    assert_eq!(metrics.active_workers, 1);
    assert_eq!(metrics.signing_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn item_budget_evicts_least_recently_used_hosts() {
    let root = generate_root("budget.mitm-ca");
    let config = CertificateAuthorityConfig::new(1 << 20, 3, 2, 3_600);
    let authority = CertificateAuthority::new(
        root.cert_pem.as_bytes(),
        root.key_pem.as_bytes(),
        config,
    )
    .expect("authority");

    for index in 0..5 {
        let host = format!("host-{index}.example.com");
        drop(authority.get(&host).await.expect("leaf"));
    }

    assert_eq!(authority.cached_entries(), 3);
    assert_eq!(authority.metrics_snapshot().cache_evictions, 2);

    let newest = authority.get("host-4.example.com").await.expect("newest");
    assert_eq!(newest.cache_status, LeafCacheStatus::Hit);
    drop(newest);
    let oldest = authority.get("host-0.example.com").await.expect("oldest");
    assert_eq!(oldest.cache_status, LeafCacheStatus::Miss);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn held_configs_pin_entries_past_the_budget() {
    let root = generate_root("pinned.mitm-ca");
    let config = CertificateAuthorityConfig::new(1 << 20, 1, 2, 3_600);
    let authority = CertificateAuthority::new(
        root.cert_pem.as_bytes(),
        root.key_pem.as_bytes(),
        config,
    )
    .expect("authority");

    let first = authority.get("first.example.com").await.expect("first");
    let second = authority.get("second.example.com").await.expect("second");
    assert_eq!(authority.cached_entries(), 2);

    drop(first);
    drop(second);
    drop(authority.get("third.example.com").await.expect("third"));
    assert_eq!(authority.cached_entries(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_leaves_are_reissued() {
    let root = generate_root("ttl.mitm-ca");
    let config = CertificateAuthorityConfig::new(1 << 20, 100, 2, 1);
    let authority = CertificateAuthority::new(
        root.cert_pem.as_bytes(),
        root.key_pem.as_bytes(),
        config,
    )
    .expect("authority");

    let first = authority.get("api.example.com").await.expect("first");
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let second = authority.get("api.example.com").await.expect("second");

    assert_eq!(second.cache_status, LeafCacheStatus::Miss);
    assert!(!first.same_identity(&second));
    assert_ne!(first.leaf_cert_der(), second.leaf_cert_der());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_request_does_not_stall_its_worker() {
    let root = generate_root("abandon.mitm-ca");
    let config = test_config(1);
    let signer =
        scripted_signer(&config).slow_for("slow.example.com", Duration::from_millis(300));
    let calls = signer.calls();
    let authority = scripted_authority(&root, config, signer);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), authority.get("slow.example.com")).await;
    assert!(abandoned.is_err(), "request should still be signing");

    let retried = authority.get("slow.example.com").await.expect("retried leaf");
    assert_eq!(retried.cache_status, LeafCacheStatus::Hit);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(authority.metrics_snapshot().abandoned_replies, 1);

    let other = authority.get("other.example.com").await.expect("other leaf");
    assert_eq!(other.cache_status, LeafCacheStatus::Miss);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_drains_queued_requests() {
    let root = generate_root("drain.mitm-ca");
    let config = test_config(1);
    let signer =
        scripted_signer(&config).slow_for("slow.example.com", Duration::from_millis(200));
    let authority = Arc::new(scripted_authority(&root, config, signer));

    let tasks: Vec<_> = ["slow.example.com", "a.example.com", "b.example.com"]
        .into_iter()
        .map(|host| {
            let authority = Arc::clone(&authority);
            tokio::spawn(async move { authority.get(host).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closing = Arc::clone(&authority);
    tokio::task::spawn_blocking(move || closing.close())
        .await
        .expect("close");

    for task in tasks {
        task.await.expect("join").expect("queued request served before close");
    }
    assert_eq!(authority.metrics_snapshot().active_workers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_after_close_fails_and_workers_exit() {
    let root = generate_root("close.mitm-ca");
    let authority = CertificateAuthority::new(
        root.cert_pem.as_bytes(),
        root.key_pem.as_bytes(),
        test_config(3),
    )
    .expect("authority");
    assert_eq!(authority.metrics_snapshot().active_workers, 3);
    let before_close = authority.get("api.example.com").await.expect("leaf");

    authority.close();
    assert!(authority.is_closed());
    assert_eq!(authority.metrics_snapshot().active_workers, 0);

    match authority.get("api.example.com").await {
        Err(CaError::Closed) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("get after close unexpectedly succeeded"),
    }
    authority.close();
    assert_eq!(before_close.identity().host(), "api.example.com");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_hostname_is_rejected_without_touching_workers() {
    let root = generate_root("input.mitm-ca");
    let authority = CertificateAuthority::new(
        root.cert_pem.as_bytes(),
        root.key_pem.as_bytes(),
        test_config(2),
    )
    .expect("authority");

    match authority.get("").await {
        Err(CaError::InvalidInput(detail)) => assert!(detail.contains("empty")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("empty hostname unexpectedly produced a leaf"),
    }
    let metrics = authority.metrics_snapshot();
    assert_eq!(metrics.cache_misses, 0);
    assert_eq!(metrics.pooled_requests_allocated, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_hostnames_are_never_signed() {
    let root = generate_root("malformed-host.mitm-ca");
    let config = test_config(2);
    let signer = scripted_signer(&config);
    let calls = signer.calls();
    let authority = scripted_authority(&root, config, signer);

    for host in ["foo/bar", "evil.com:443", "x@y", "a..b", "[::1]"] {
        match authority.get(host).await {
            Err(CaError::InvalidInput(_)) => {}
            Err(other) => panic!("unexpected error for {host:?}: {other}"),
            Ok(_) => panic!("malformed hostname {host:?} unexpectedly produced a leaf"),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(authority.cached_entries(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_gets_reuse_pooled_requests() {
    let root = generate_root("pool.mitm-ca");
    let authority = CertificateAuthority::new(
        root.cert_pem.as_bytes(),
        root.key_pem.as_bytes(),
        test_config(2),
    )
    .expect("authority");

    for host in ["a.example.com", "b.example.com", "a.example.com"] {
        drop(authority.get(host).await.expect("leaf"));
    }
    let metrics = authority.metrics_snapshot();
    assert_eq!(metrics.pooled_requests_allocated, 1);
    assert_eq!(metrics.pooled_requests_reused, 2);
}

#[test]
fn blocking_get_serves_synchronous_callers() {
    let root = generate_root("blocking.mitm-ca");
    let authority = CertificateAuthority::new(
        root.cert_pem.as_bytes(),
        root.key_pem.as_bytes(),
        test_config(2),
    )
    .expect("authority");

    let first = authority.get_blocking("api.example.com").expect("first");
    let second = authority.get_blocking("api.example.com").expect("second");
    assert!(first.same_identity(&second));
    assert_eq!(second.cache_status.as_str(), "hit");
}

#[test]
fn construction_rejects_mismatched_and_malformed_roots() {
    let first = generate_root("first.mitm-ca");
    let second = generate_root("second.mitm-ca");

    match CertificateAuthority::new(
        first.cert_pem.as_bytes(),
        second.key_pem.as_bytes(),
        test_config(2),
    ) {
        Err(CaError::KeyMismatch) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("mismatched root key unexpectedly accepted"),
    }

    match CertificateAuthority::new(b"garbage", first.key_pem.as_bytes(), test_config(2)) {
        Err(CaError::Parse(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("garbage certificate unexpectedly accepted"),
    }

    match CertificateAuthority::new(
        first.cert_pem.as_bytes(),
        first.key_pem.as_bytes(),
        test_config(0),
    ) {
        Err(CaError::InvalidConfig(detail)) => assert!(detail.contains("workers")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("zero workers unexpectedly accepted"),
    }
}

#[test]
fn loads_root_material_from_pem_files() {
    let root = generate_root("files.mitm-ca");
    let dir = std::env::temp_dir().join(format!(
        "mitm-ca-files-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let cert_path = dir.join("root-cert.pem");
    let key_path = dir.join("root-key.pem");
    std::fs::write(&cert_path, &root.cert_pem).expect("write cert");
    std::fs::write(&key_path, &root.key_pem).expect("write key");

    let authority =
        CertificateAuthority::from_pem_files(&cert_path, &key_path, test_config(1)).expect("load");
    assert_eq!(authority.root().common_name(), Some("files.mitm-ca"));

    match CertificateAuthority::from_pem_files(dir.join("missing.pem"), &key_path, test_config(1)) {
        Err(CaError::Io(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("missing certificate file unexpectedly accepted"),
    }

    std::fs::remove_dir_all(&dir).expect("cleanup temp dir");
}
