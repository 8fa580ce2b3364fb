//! Trust relationships between the process CA and the leaves it issues

use sockbridge_cert::{verify_leaf, CertError, CertificateAuthority};

#[test]
fn test_leaf_verifies_against_issuing_ca() {
    let ca = CertificateAuthority::generate().expect("CA generation");

    for name in ["cn.example.com", "127.0.0.1", "localhost"] {
        let (chain, _key) = ca.issue_leaf(name, &[]).expect("leaf issuance").into_parts();
        verify_leaf(&chain, ca.cert_der(), name)
            .unwrap_or_else(|e| panic!("{} should verify: {}", name, e));
    }
}

#[test]
fn test_leaf_rejected_by_foreign_ca() {
    let ca = CertificateAuthority::generate().expect("CA generation");
    let other = CertificateAuthority::generate().expect("CA generation");

    for name in ["cn.example.com", "127.0.0.1", "localhost"] {
        let (chain, _key) = ca.issue_leaf(name, &[]).expect("leaf issuance").into_parts();
        let result = verify_leaf(&chain, other.cert_der(), name);
        assert!(
            matches!(result, Err(CertError::VerificationFailed(_))),
            "{} must not verify against another CA",
            name
        );
    }
}

#[test]
fn test_leaf_rejected_for_wrong_name() {
    let ca = CertificateAuthority::generate().expect("CA generation");
    let (chain, _key) = ca
        .issue_leaf("cn.example.com", &[])
        .expect("leaf issuance")
        .into_parts();

    assert!(verify_leaf(&chain, ca.cert_der(), "other.example.com").is_err());
}

#[test]
fn test_server_leaf_covers_loopback_and_extra_ip() {
    let ca = CertificateAuthority::generate().expect("CA generation");
    let (chain, _key) = ca
        .issue_server_leaf("localhost", Some("192.168.10.20".parse().unwrap()))
        .expect("leaf issuance")
        .into_parts();

    verify_leaf(&chain, ca.cert_der(), "localhost").unwrap();
    verify_leaf(&chain, ca.cert_der(), "127.0.0.1").unwrap();
    verify_leaf(&chain, ca.cert_der(), "192.168.10.20").unwrap();
}

#[test]
fn test_persisted_ca_keeps_trust() {
    let ca = CertificateAuthority::generate().expect("CA generation");

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca.pem");
    let key_path = dir.path().join("ca.key");
    ca.save_to_files(&cert_path, &key_path).unwrap();

    let reloaded = CertificateAuthority::load(&cert_path, &key_path).expect("CA reload");
    assert_eq!(reloaded.cert_der(), ca.cert_der());

    // A leaf from the reloaded CA is trusted by peers holding the original anchor
    let (chain, _key) = reloaded
        .issue_leaf("localhost", &[])
        .expect("leaf issuance")
        .into_parts();
    verify_leaf(&chain, ca.cert_der(), "localhost").unwrap();
}

#[test]
fn test_load_ca_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca.pem");
    let key_path = dir.path().join("ca.key");
    std::fs::write(&cert_path, "garbage").unwrap();
    std::fs::write(&key_path, "garbage").unwrap();

    assert!(matches!(
        CertificateAuthority::load(&cert_path, &key_path),
        Err(CertError::CertificateLoadError { .. })
    ));
}
