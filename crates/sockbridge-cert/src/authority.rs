//! Process certificate authority and leaf issuance
//!
//! The CA is normally generated at startup and lives only in memory. Routes
//! that trust it in `"inner"` mode across restarts need the operator to save
//! it with [`CertificateAuthority::save_to_files`] and reload it with
//! [`CertificateAuthority::load`].

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::CertError;

/// RSA modulus size for every key this module generates
pub const RSA_KEY_BITS: usize = 2048;

const CA_SERIAL: u64 = 1;
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
const CA_COMMON_NAME: &str = "Sockbridge Root CA";
const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn organization_dn(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "US");
    dn.push(DnType::StateOrProvinceName, "California");
    dn.push(DnType::LocalityName, "San Francisco");
    dn.push(DnType::OrganizationName, "Sockbridge");
    dn.push(DnType::OrganizationalUnitName, "Tunnel");
    dn.push(DnType::CommonName, common_name);
    dn
}

fn generate_rsa_key_pair() -> Result<KeyPair, String> {
    let private_key =
        RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS).map_err(|e| e.to_string())?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| e.to_string())?;
    KeyPair::from_pem_and_sign_algo(pem.as_str(), &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| e.to_string())
}

fn issuance_failed(e: impl ToString) -> CertError {
    CertError::CertificateIssuanceFailed(e.to_string())
}

/// A leaf certificate signed by the process CA
pub struct IssuedCertificate {
    /// Certificate in DER format (binary)
    pub cert_der: CertificateDer<'static>,

    /// PKCS#8 private key in DER format (binary)
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format (text)
    pub pem_cert: String,

    /// Private key in PEM format (text)
    pub pem_key: String,
}

impl IssuedCertificate {
    /// Split into the chain and key pair rustls expects
    pub fn into_parts(self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        (vec![self.cert_der], self.key_der)
    }

    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}

/// Self-signed RSA certificate authority used to issue route leaves
pub struct CertificateAuthority {
    signer: Certificate,
    key_pair: KeyPair,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
}

impl CertificateAuthority {
    /// Generate a fresh CA.
    ///
    /// Failure here is fatal for any route relying on auto-issued certificates.
    pub fn generate() -> Result<Self, CertError> {
        let key_pair = generate_rsa_key_pair().map_err(CertError::CaGenerationFailed)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = organization_dn(CA_COMMON_NAME);
        params.serial_number = Some(SerialNumber::from(CA_SERIAL));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let signer = params
            .self_signed(&key_pair)
            .map_err(|e| CertError::CaGenerationFailed(e.to_string()))?;

        info!("Generated certificate authority");

        Ok(Self {
            cert_der: CertificateDer::from(signer.der().to_vec()),
            cert_pem: signer.pem(),
            signer,
            key_pair,
        })
    }

    /// Load a previously saved CA from PEM files
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert_pem =
            std::fs::read_to_string(cert_path).map_err(|e| CertError::load(cert_path, e))?;
        let key_pem =
            std::fs::read_to_string(key_path).map_err(|e| CertError::load(key_path, e))?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CertError::load(key_path, e))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| CertError::load(cert_path, e))?;

        let cert_der = crate::loader::load_cert(cert_path)?;

        // Re-signing yields an issuer handle with the same subject and key;
        // the anchor handed to peers stays the original certificate.
        let signer = params
            .self_signed(&key_pair)
            .map_err(|e| CertError::load(cert_path, e))?;

        debug!(path = %cert_path.display(), "Loaded certificate authority");

        Ok(Self {
            signer,
            key_pair,
            cert_der,
            cert_pem,
        })
    }

    /// Save CA certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, self.key_pair.serialize_pem())?;
        Ok(())
    }

    /// The CA certificate, as handed to peers trusting this CA
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Issue a leaf valid for both client and server authentication.
    ///
    /// The common name is also added as a SAN, as an IP SAN when it parses as
    /// an address. A non-empty `ip_addresses` list always gains `127.0.0.1`.
    pub fn issue_leaf(
        &self,
        common_name: &str,
        ip_addresses: &[IpAddr],
    ) -> Result<IssuedCertificate, CertError> {
        let key_pair = generate_rsa_key_pair().map_err(issuance_failed)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = organization_dn(common_name);
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let name_ip = common_name.parse::<IpAddr>().ok();
        let mut sans = Vec::new();
        match name_ip {
            Some(ip) => sans.push(SanType::IpAddress(ip)),
            None => {
                let dns = rcgen::Ia5String::try_from(common_name).map_err(issuance_failed)?;
                sans.push(SanType::DnsName(dns));
            }
        }

        let mut ips: Vec<IpAddr> = ip_addresses.to_vec();
        if !ips.is_empty() && !ips.contains(&LOOPBACK) {
            ips.push(LOOPBACK);
        }
        ips.dedup();
        sans.extend(
            ips.into_iter()
                .filter(|ip| Some(*ip) != name_ip)
                .map(SanType::IpAddress),
        );
        params.subject_alt_names = sans;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&key_pair, &self.signer, &self.key_pair)
            .map_err(issuance_failed)?;

        debug!(common_name, "Issued leaf certificate");

        Ok(IssuedCertificate {
            cert_der: CertificateDer::from(cert.der().to_vec()),
            key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
            pem_cert: cert.pem(),
            pem_key: key_pair.serialize_pem(),
        })
    }

    /// Issue the leaf an auto-provisioned inbound endpoint presents
    pub fn issue_server_leaf(
        &self,
        name: &str,
        extra_ip: Option<IpAddr>,
    ) -> Result<IssuedCertificate, CertError> {
        let mut ips: Vec<IpAddr> = extra_ip.into_iter().collect();
        ips.push(LOOPBACK);
        self.issue_leaf(name, &ips)
    }
}
