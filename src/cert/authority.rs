//! Certificate Authority and leaf issuance

use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::net::IpAddr;
use time::{Duration, OffsetDateTime};

use crate::error::{Error, Result};

/// CA certificates live twenty years and rotate three years early.
pub const CA_LIFETIME: Duration = Duration::days(20 * 365);
pub const CA_ROTATE_REMAINING: Duration = Duration::days(3 * 365);

/// Leaves live two years and rotate two months early; the proxy-self
/// leaf is checked against the same two-month threshold at boot.
pub const LEAF_LIFETIME: Duration = Duration::days(2 * 365);
pub const LEAF_ROTATE_REMAINING: Duration = Duration::days(61);

/// Certificates are backdated a day so freshly issued material is valid
/// on clients with mildly skewed clocks.
const BACKDATE: Duration = Duration::days(1);

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "World");
    dn.push(DnType::StateOrProvinceName, "World");
    dn.push(DnType::LocalityName, "World");
    dn.push(DnType::OrganizationName, "Violentproxy");
    dn.push(DnType::OrganizationalUnitName, "Violenttls Engine");
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Netscape cert type (2.16.840.1.113730.1.1), SSL client and server
/// bits set. rcgen has no first-class support for the legacy extension,
/// so the BIT STRING is hand-encoded: two bits used, value 0xC0.
fn ns_cert_type_extension() -> CustomExtension {
    const NS_CERT_TYPE_OID: &[u64] = &[2, 16, 840, 1, 113730, 1, 1];
    CustomExtension::from_oid_content(NS_CERT_TYPE_OID, vec![0x03, 0x02, 0x06, 0xC0])
}

/// Generate a key pair for certificate material.
///
/// RSA-2048 is preferred for client compatibility; backends without RSA
/// generation fall back to ECDSA P-256.
fn generate_key_pair() -> Result<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .or_else(|_| KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256))
        .map_err(|e| Error::certificate(format!("key generation failed: {}", e)))
}

fn push_sans(params: &mut CertificateParams, dns_names: &[String], ips: &[String]) -> Result<()> {
    for name in dns_names {
        let san = name
            .as_str()
            .try_into()
            .map_err(|e| Error::certificate(format!("Invalid SAN '{}': {}", name, e)))?;
        params.subject_alt_names.push(SanType::DnsName(san));
    }
    for ip in ips {
        match ip.parse::<IpAddr>() {
            Ok(addr) => params.subject_alt_names.push(SanType::IpAddress(addr)),
            Err(_) => tracing::warn!(ip = %ip, "Ignoring unparseable SAN IP address"),
        }
    }
    Ok(())
}

fn first_cert_der(pem: &str) -> Result<CertificateDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .transpose()
        .map_err(|e| Error::certificate(format!("Failed to parse certificate PEM: {}", e)))?
        .ok_or_else(|| Error::certificate("No certificate found in PEM"));
    cert
}

fn private_key_der(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::certificate(format!("Failed to parse private key PEM: {}", e)))?
        .ok_or_else(|| Error::certificate("No private key found in PEM"))
}

/// Seconds of validity a PEM certificate has left. Negative once
/// expired.
pub fn remaining_validity(cert_pem: &str) -> Result<Duration> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::certificate(format!("Failed to parse certificate PEM: {}", e)))?;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents)
        .map_err(|e| Error::certificate(format!("Failed to parse certificate DER: {}", e)))?;
    let not_after = cert.validity().not_after.timestamp();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    Ok(Duration::seconds(not_after - now))
}

/// The certificate authority: self-signed root material plus the signing
/// handle leaves are issued from.
pub struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    pub cert_pem: String,
    pub key_pem: String,
    pub public_pem: String,
    cert_der: CertificateDer<'static>,
}

impl CaMaterial {
    /// Generate a fresh CA carrying the configured proxy names as SANs.
    pub fn generate(domains: &[String], ips: &[String]) -> Result<Self> {
        Self::generate_with_lifetime(domains, ips, CA_LIFETIME)
    }

    /// Like [`CaMaterial::generate`] with an explicit lifetime, so the
    /// rotation thresholds can be exercised.
    pub fn generate_with_lifetime(
        domains: &[String],
        ips: &[String],
        lifetime: Duration,
    ) -> Result<Self> {
        let key = generate_key_pair()?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name("Violentca");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::Any];
        params.custom_extensions = vec![ns_cert_type_extension()];
        push_sans(&mut params, domains, ips)?;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + lifetime;

        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::certificate(format!("CA self-sign failed: {}", e)))?;

        let cert_pem = cert.pem();
        let cert_der = cert.der().clone();
        let public_pem = key.public_key_pem();
        let key_pem = key.serialize_pem();

        Ok(Self {
            issuer: Issuer::new(params, key),
            cert_pem,
            key_pem,
            public_pem,
            cert_der,
        })
    }

    /// Load previously persisted CA material.
    pub fn load(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA private key: {}", e)))?;
        let public_pem = key.public_key_pem();
        let cert_der = first_cert_der(cert_pem)?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)
            .map_err(|e| Error::certificate(format!("Failed to parse CA certificate: {}", e)))?;

        Ok(Self {
            issuer,
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            public_pem,
            cert_der,
        })
    }

    /// Issue a leaf for the given SANs, subject CN `Violentserver`.
    pub fn issue_leaf(&self, dns_names: &[String], ips: &[String]) -> Result<LeafMaterial> {
        self.issue_leaf_with_lifetime(dns_names, ips, LEAF_LIFETIME)
    }

    pub fn issue_leaf_with_lifetime(
        &self,
        dns_names: &[String],
        ips: &[String],
        lifetime: Duration,
    ) -> Result<LeafMaterial> {
        let key = generate_key_pair()?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name("Violentserver");
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.custom_extensions = vec![ns_cert_type_extension()];
        params.use_authority_key_identifier_extension = true;
        push_sans(&mut params, dns_names, ips)?;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + lifetime;

        let cert = params
            .signed_by(&key, &self.issuer)
            .map_err(|e| Error::certificate(format!("Leaf signing failed: {}", e)))?;

        let cert_pem = cert.pem();
        let cert_der = cert.der().clone();
        let public_pem = key.public_key_pem();
        let key_pem = key.serialize_pem();
        let key_der = private_key_der(&key_pem)?;

        Ok(LeafMaterial {
            cert_pem,
            key_pem,
            public_pem,
            cert_der,
            key_der,
        })
    }

    /// DER-encoded CA certificate, for client trust stores and for
    /// chain building.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

impl std::fmt::Debug for CaMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaMaterial").finish_non_exhaustive()
    }
}

/// A signed leaf certificate plus its private key.
pub struct LeafMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    pub public_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
}

impl LeafMaterial {
    /// Reconstruct a leaf from persisted PEM material.
    pub fn from_pem(cert_pem: &str, key_pem: &str, public_pem: &str) -> Result<Self> {
        let cert_der = first_cert_der(cert_pem)?;
        let key_der = private_key_der(key_pem)?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            public_pem: public_pem.to_string(),
            cert_der,
            key_der,
        })
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        self.key_der.clone_key()
    }

    /// Build a rustls server identity serving the chain `[leaf, CA]`.
    pub fn certified_key(
        &self,
        ca_der: &CertificateDer<'static>,
    ) -> Result<rustls::sign::CertifiedKey> {
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&self.key_der)
            .map_err(|e| Error::tls(format!("Unusable leaf key: {}", e)))?;
        let chain = vec![self.cert_der.clone(), ca_der.clone()];
        Ok(rustls::sign::CertifiedKey::new(chain, signing_key))
    }

    /// Build a rustls `ServerConfig` for a listener presenting this leaf.
    pub fn server_config(&self, ca_der: &CertificateDer<'static>) -> Result<ServerConfig> {
        let chain = vec![self.cert_der.clone(), ca_der.clone()];
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, self.key_der())
            .map_err(|e| Error::tls(format!("Failed to build server config: {}", e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

impl std::fmt::Debug for LeafMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafMaterial").finish_non_exhaustive()
    }
}
