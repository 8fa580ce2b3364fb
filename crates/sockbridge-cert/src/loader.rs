//! Loading operator-supplied PEM material

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::InconsistentKeys;

use crate::CertError;

/// Load every certificate from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let file = File::open(path).map_err(|e| CertError::load(path, e))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::load(path, e))?;

    if certs.is_empty() {
        return Err(CertError::load(path, "no certificates found"));
    }

    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let file = File::open(path).map_err(|e| CertError::load(path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::load(path, e))?
        .ok_or_else(|| CertError::load(path, "no private key found"))
}

/// Load a single trusted certificate
pub fn load_cert(path: &Path) -> Result<CertificateDer<'static>, CertError> {
    let mut certs = load_certs(path)?;
    Ok(certs.swap_remove(0))
}

/// Load a certificate chain and its key, checking that they belong together
pub fn load_cert_key_pair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CertError> {
    let chain = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CertError::load(key_path, e))?;

    match CertifiedKey::new(chain.clone(), signing_key).keys_match() {
        Ok(()) => {}
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)) => {
            return Err(CertError::load(
                key_path,
                format!("key does not match certificate {}", cert_path.display()),
            ));
        }
        // The key type cannot report its public half; the handshake will tell.
        Err(_) => {}
    }

    Ok((chain, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CertificateAuthority;

    #[test]
    fn test_missing_file() {
        let result = load_cert(Path::new("/nonexistent/sockbridge/cert.pem"));
        assert!(matches!(
            result,
            Err(CertError::CertificateLoadError { .. })
        ));
    }

    #[test]
    fn test_empty_pem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a pem file\n").unwrap();

        assert!(matches!(
            load_cert(&path),
            Err(CertError::CertificateLoadError { .. })
        ));
        assert!(matches!(
            load_private_key(&path),
            Err(CertError::CertificateLoadError { .. })
        ));
    }

    #[test]
    fn test_load_pair_and_mismatch() {
        let ca = CertificateAuthority::generate().unwrap();
        let first = ca.issue_leaf("localhost", &[]).unwrap();
        let second = ca.issue_leaf("localhost", &[]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        first.save_to_files(&cert_path, &key_path).unwrap();

        let (chain, _key) = load_cert_key_pair(&cert_path, &key_path).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0], first.cert_der);

        let other_key = dir.path().join("other.pem");
        std::fs::write(&other_key, &second.pem_key).unwrap();
        assert!(matches!(
            load_cert_key_pair(&cert_path, &other_key),
            Err(CertError::CertificateLoadError { .. })
        ));
    }
}
