use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{ServerName, UnixTime};
use rustls::RootCertStore;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{parse_x509_certificate, FromDer, X509Certificate};

use crate::{IssuedServerConfig, LeafKeyAlgorithm};

fn leaf_authority(config: CertificateAuthorityConfig) -> (GeneratedRoot, CertificateAuthority) {
    let root = generate_root("leaf-checks.mitm-ca");
    let authority =
        CertificateAuthority::new(root.cert_pem.as_bytes(), root.key_pem.as_bytes(), config)
            .expect("authority");
    (root, authority)
}

fn verify_for_name(
    authority: &CertificateAuthority,
    issued: &IssuedServerConfig,
    name: &str,
) -> Result<(), rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.add(authority.root_certificate_der().clone())?;
    let verifier = WebPkiServerVerifier::builder_with_provider(
        Arc::new(roots),
        Arc::new(rustls::crypto::ring::default_provider()),
    )
    .build()
    .map_err(|error| rustls::Error::General(error.to_string()))?;
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|error| rustls::Error::General(error.to_string()))?;
    verifier
        .verify_server_cert(
            issued.leaf_cert_der(),
            &[],
            &server_name,
            &[],
            UnixTime::now(),
        )
        .map(|_| ())
}

fn subject_alt_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let Some(extension) = cert.subject_alternative_name().expect("san extension parse") else {
        return Vec::new();
    };
    extension
        .value
        .general_names
        .iter()
        .map(|name| match name {
            GeneralName::DNSName(value) => (*value).to_string(),
            GeneralName::IPAddress(value) => format!("ip:{value:?}"),
            other => format!("{other:?}"),
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaf_chains_to_root_and_matches_hostname() {
    let (_root, authority) = leaf_authority(test_config(2));
    let issued = authority.get("api.example.com").await.expect("leaf");

    verify_for_name(&authority, &issued, "api.example.com").expect("valid chain for host");
    match verify_for_name(&authority, &issued, "other.example.com") {
        Err(rustls::Error::InvalidCertificate(_)) => {}
        other => panic!("unexpected verification result for wrong host: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaf_subject_and_san_carry_the_hostname() {
    let (_root, authority) = leaf_authority(test_config(2));
    let issued = authority.get("API.Example.com").await.expect("leaf");

    let (_, leaf) = parse_x509_certificate(issued.leaf_cert_der().as_ref()).expect("leaf parse");
    let common_name = leaf
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .expect("leaf common name");
    assert_eq!(common_name, "api.example.com");
    assert_eq!(subject_alt_names(&leaf), vec!["api.example.com".to_string()]);
    assert!(!leaf.is_ca());
    let key_usage = leaf
        .key_usage()
        .expect("key usage parse")
        .expect("key usage present");
    assert!(key_usage.value.digital_signature());
    assert!(!key_usage.value.key_encipherment());

    let (_, root) = parse_x509_certificate(authority.root_certificate_der().as_ref())
        .expect("root parse");
    assert_eq!(leaf.issuer().to_string(), root.subject().to_string());
    leaf.verify_signature(Some(root.public_key()))
        .expect("leaf signed by root key");

    let stranger = generate_root("stranger.mitm-ca");
    let (_, stranger) = X509Certificate::from_der(&stranger.cert_der).expect("stranger parse");
    assert!(leaf.verify_signature(Some(stranger.public_key())).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ip_literal_hosts_get_ip_subject_alt_names() {
    let (_root, authority) = leaf_authority(test_config(2));
    let issued = authority.get("127.0.0.1").await.expect("leaf");

    let (_, leaf) = parse_x509_certificate(issued.leaf_cert_der().as_ref()).expect("leaf parse");
    let san = leaf
        .subject_alternative_name()
        .expect("san parse")
        .expect("san present");
    let expected = [127_u8, 0, 0, 1];
    assert!(san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == expected)));
    verify_for_name(&authority, &issued, "127.0.0.1").expect("valid chain for ip");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaf_key_matches_leaf_certificate() {
    let (_root, authority) = leaf_authority(test_config(2));
    let issued = authority.get("keys.example.com").await.expect("leaf");

    let key = rcgen::KeyPair::try_from(issued.leaf_key_der().secret_pkcs8_der())
        .expect("leaf key parse");
    let (_, leaf) = parse_x509_certificate(issued.leaf_cert_der().as_ref()).expect("leaf parse");
    assert_eq!(
        leaf.public_key().subject_public_key.data.as_ref(),
        key.public_key_raw()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validity_window_covers_clock_skew_and_configured_lifetime() {
    let mut config = test_config(2);
    config.leaf_validity_seconds = Some(7_200);
    let (_root, authority) = leaf_authority(config);
    let issued = authority.get("validity.example.com").await.expect("leaf");

    let (_, leaf) = parse_x509_certificate(issued.leaf_cert_der().as_ref()).expect("leaf parse");
    let not_before = leaf.validity().not_before.timestamp();
    let not_after = leaf.validity().not_after.timestamp();
    let now = time::OffsetDateTime::now_utc().unix_timestamp();

    assert!(not_before <= now - 240, "not_before should predate issuance");
    assert!((not_after - now - 7_200).abs() <= 60);
    assert_eq!(issued.identity().not_after().unix_timestamp(), not_after);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alpn_follows_http2_setting() {
    let (_root, authority) = leaf_authority(test_config(2));
    let http1_only = authority.get("h1.example.com").await.expect("leaf");
    assert_eq!(
        http1_only.server_config.alpn_protocols,
        vec![b"http/1.1".to_vec()]
    );

    let mut config = test_config(2);
    config.http2_enabled = true;
    let (_root, authority) = leaf_authority(config);
    let with_h2 = authority.get("h2.example.com").await.expect("leaf");
    assert_eq!(
        with_h2.server_config.alpn_protocols,
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configured_key_algorithms_issue_usable_leaves() {
    for algorithm in [LeafKeyAlgorithm::EcdsaP384, LeafKeyAlgorithm::Ed25519] {
        let mut config = test_config(1);
        config.leaf_key_algorithm = algorithm;
        let (_root, authority) = leaf_authority(config);
        let issued = authority
            .get("algorithms.example.com")
            .await
            .unwrap_or_else(|error| panic!("{algorithm:?} leaf failed: {error}"));
        verify_for_name(&authority, &issued, "algorithms.example.com")
            .unwrap_or_else(|error| panic!("{algorithm:?} leaf did not verify: {error}"));
    }
}

#[test]
fn root_pem_export_parses_back_to_the_same_der() {
    let (root, authority) = leaf_authority(test_config(1));
    assert_eq!(authority.root_certificate_der().as_ref(), root.cert_der.as_slice());

    let pem = authority.root_certificate_pem();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
    let reparsed = CertificateAuthority::new(pem.as_bytes(), &root.key_der, test_config(1))
        .expect("exported pem with der key");
    assert_eq!(
        reparsed.root_certificate_der(),
        authority.root_certificate_der()
    );
}
