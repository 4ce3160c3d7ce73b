//! CA key pair - signing material for intercepted hosts
//!
//! `CaKeyPair` owns the CA certificate as loaded from disk together with the
//! rcgen issuer rebuilt from it, so leaf certificates chain to the exact
//! certificate clients already trust. Leaves are ECDSA P-256 with a DNS or IP
//! SAN and a 90 day validity window.

use super::error::{MaterialError, MitmError, Result};
use der::asn1::{BitStringRef, ObjectIdentifier, OctetStringRef};
use der::{AnyRef, Decode, Encode, Sequence, Tag};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info};

/// Host identifier for certificate generation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com)
    Domain(String),

    /// Wildcard domain (e.g., *.example.com)
    Wildcard(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Parse from hostname string
    pub fn from_hostname(hostname: &str) -> std::result::Result<Self, MitmError> {
        let host = hostname.trim().trim_end_matches('.');
        if host.is_empty() || host.len() > 253 {
            return Err(MitmError::InvalidHost(hostname.to_string()));
        }

        let unbracketed = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return Ok(Self::IpAddress(ip));
        }

        let host = host.to_ascii_lowercase();
        if host.starts_with("*.") {
            return Ok(Self::Wildcard(host));
        }

        Ok(Self::Domain(host))
    }

    /// Canonical name used as cache key and certificate CN
    pub fn name(&self) -> String {
        match self {
            Self::Domain(d) | Self::Wildcard(d) => d.clone(),
            Self::IpAddress(ip) => ip.to_string(),
        }
    }
}

/// Leaf certificate minted for one intercepted host
pub struct LeafCertificate {
    host: String,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
}

impl LeafCertificate {
    /// Host this certificate was issued for
    pub fn host(&self) -> &str {
        &self.host
    }

    /// DER encoded certificate
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Private key for the TLS server role
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }
}

impl fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .field("cert_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

/// CA certificate and its private key
pub struct CaKeyPair {
    /// Certificate exactly as distributed to clients
    cert_der: CertificateDer<'static>,

    /// Issuer rebuilt from the certificate for signing
    issuer: Certificate,

    /// CA private key (never logged)
    key: KeyPair,
}

impl CaKeyPair {
    /// Load a PEM certificate and a PEM private key from disk
    ///
    /// The key may be PKCS#8, PKCS#1 (RSA) or SEC1 (EC).
    pub fn load(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> std::result::Result<Self, MaterialError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let cert_pem = fs::read(cert_path).map_err(|source| MaterialError::Read {
            path: cert_path.to_path_buf(),
            source,
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|source| MaterialError::Read {
            path: key_path.to_path_buf(),
            source,
        })?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .next()
            .ok_or_else(|| MaterialError::NoCertificate(cert_path.to_path_buf()))?
            .map_err(MaterialError::parse)?;

        let ca = Self::from_der(cert_der, &key_pem)?;
        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "Loaded MITM CA material"
        );
        Ok(ca)
    }

    /// Build from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> std::result::Result<Self, MaterialError> {
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| MaterialError::Parse("no certificate in PEM input".to_string()))?
            .map_err(MaterialError::parse)?;
        Self::from_der(cert_der, key_pem)
    }

    fn from_der(
        cert_der: CertificateDer<'static>,
        key_pem: &str,
    ) -> std::result::Result<Self, MaterialError> {
        let key = parse_private_key(key_pem)?;

        if !public_key_matches(&cert_der, &key)? {
            return Err(MaterialError::KeyMismatch);
        }

        let params = CertificateParams::from_ca_cert_der(&cert_der).map_err(MaterialError::parse)?;
        let issuer = params.self_signed(&key).map_err(MaterialError::parse)?;

        Ok(Self {
            cert_der,
            issuer,
            key,
        })
    }

    /// Generate a fresh self-signed CA
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);

        let key = KeyPair::generate().map_err(|e| MitmError::cert_generation(common_name, e))?;
        let issuer = params
            .self_signed(&key)
            .map_err(|e| MitmError::cert_generation(common_name, e))?;

        Ok(Self {
            cert_der: issuer.der().clone(),
            issuer,
            key,
        })
    }

    /// CA certificate in DER form
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// CA certificate in PEM form
    pub fn cert_pem(&self) -> String {
        let block = pem::Pem::new("CERTIFICATE", self.cert_der.to_vec());
        pem::encode_config(
            &block,
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        )
    }

    /// CA private key in PEM form
    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// True when the private key belongs to the CA certificate
    pub fn matches(&self) -> bool {
        public_key_matches(&self.cert_der, &self.key).unwrap_or(false)
    }

    /// True when `leaf` carries a valid signature from this CA
    pub fn verify(&self, leaf: &LeafCertificate) -> bool {
        let Ok((_, ca)) = x509_parser::parse_x509_certificate(self.cert_der.as_ref()) else {
            return false;
        };
        let Ok((_, cert)) = x509_parser::parse_x509_certificate(leaf.cert_der.as_ref()) else {
            return false;
        };
        cert.verify_signature(Some(ca.public_key())).is_ok()
    }

    /// Mint a leaf certificate for `host`
    pub fn sign(&self, host: &HostIdentifier) -> Result<LeafCertificate> {
        let name = host.name();
        let mut params = CertificateParams::default();

        params.distinguished_name.push(DnType::CommonName, name.as_str());
        params.subject_alt_names = vec![match host {
            HostIdentifier::IpAddress(ip) => SanType::IpAddress(*ip),
            HostIdentifier::Domain(d) | HostIdentifier::Wildcard(d) => SanType::DnsName(
                d.clone()
                    .try_into()
                    .map_err(|_| MitmError::InvalidHost(d.clone()))?,
            ),
        }];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(90);
        params.serial_number = Some(SerialNumber::from(generate_serial_number()));

        let key_pair = KeyPair::generate().map_err(|e| MitmError::cert_generation(&name, e))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer, &self.key)
            .map_err(|e| MitmError::cert_generation(&name, e))?;

        debug!(host = %name, "Minted leaf certificate");

        Ok(LeafCertificate {
            host: name,
            cert_der: cert.der().clone(),
            key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        })
    }
}

impl fmt::Debug for CaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaKeyPair")
            .field("cert_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

fn public_key_matches(
    cert_der: &CertificateDer<'_>,
    key: &KeyPair,
) -> std::result::Result<bool, MaterialError> {
    let (_, cert) =
        x509_parser::parse_x509_certificate(cert_der.as_ref()).map_err(MaterialError::parse)?;
    let cert_key: &[u8] = cert.public_key().subject_public_key.data.as_ref();
    Ok(cert_key == key.public_key_raw())
}

/// Unique serial number from crypto RNG + timestamp
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;

    // Top bit cleared so the DER integer stays positive
    (((timestamp_part as u64) << 32) | random_part as u64) & (u64::MAX >> 1)
}

const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

#[derive(Sequence)]
struct AlgorithmIdentifier<'a> {
    algorithm: ObjectIdentifier,
    parameters: Option<AnyRef<'a>>,
}

/// RFC 5208 PrivateKeyInfo
#[derive(Sequence)]
struct PrivateKeyInfo<'a> {
    version: u8,
    algorithm: AlgorithmIdentifier<'a>,
    private_key: OctetStringRef<'a>,
}

/// RFC 5915 ECPrivateKey
#[derive(Sequence)]
struct EcPrivateKey<'a> {
    version: u8,
    private_key: OctetStringRef<'a>,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    parameters: Option<ObjectIdentifier>,
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT", optional = "true")]
    public_key: Option<BitStringRef<'a>>,
}

/// Parse a PEM private key in any of the common encodings
///
/// rcgen only reads PKCS#8, so PKCS#1 and SEC1 keys are rewrapped first.
fn parse_private_key(key_pem: &str) -> std::result::Result<KeyPair, MaterialError> {
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(MaterialError::parse)?
        .ok_or_else(|| MaterialError::Parse("no private key in PEM input".to_string()))?;

    let pkcs8 = match &key {
        PrivateKeyDer::Pkcs8(doc) => doc.secret_pkcs8_der().to_vec(),
        PrivateKeyDer::Pkcs1(doc) => wrap_pkcs8(
            RSA_ENCRYPTION,
            AnyRef::new(Tag::Null, &[]).map_err(MaterialError::parse)?,
            doc.secret_pkcs1_der(),
        )?,
        PrivateKeyDer::Sec1(doc) => {
            let ec = EcPrivateKey::from_der(doc.secret_sec1_der()).map_err(MaterialError::parse)?;
            if ec.version != 1 || ec.private_key.as_bytes().is_empty() || ec.public_key.is_none() {
                return Err(MaterialError::Parse("malformed EC private key".to_string()));
            }
            let curve = ec.parameters.ok_or_else(|| {
                MaterialError::Parse("EC private key does not name its curve".to_string())
            })?;
            wrap_pkcs8(
                EC_PUBLIC_KEY,
                AnyRef::new(Tag::ObjectIdentifier, curve.as_bytes()).map_err(MaterialError::parse)?,
                doc.secret_sec1_der(),
            )?
        }
        _ => return Err(MaterialError::Parse("unsupported private key encoding".to_string())),
    };

    KeyPair::try_from(&PrivatePkcs8KeyDer::from(pkcs8)).map_err(MaterialError::parse)
}

fn wrap_pkcs8(
    algorithm: ObjectIdentifier,
    parameters: AnyRef<'_>,
    key: &[u8],
) -> std::result::Result<Vec<u8>, MaterialError> {
    PrivateKeyInfo {
        version: 0,
        algorithm: AlgorithmIdentifier {
            algorithm,
            parameters: Some(parameters),
        },
        private_key: OctetStringRef::new(key).map_err(MaterialError::parse)?,
    }
    .to_der()
    .map_err(MaterialError::parse)
}
