//! Root certificate management and on-demand leaf issuance for TLS
//! interception.
//!
//! The CA is loaded from (or generated to) PEM files once at startup. Leaf
//! certificates are minted per host the first time a client tunnels to it
//! and stay cached, together with a ready-to-use rustls `ServerConfig`, for
//! the life of the process.

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use super::keys;
use crate::error::CaError;
use crate::host::normalize_host;

pub const CA_COMMON_NAME: &str = "Proxy CA";

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// A leaf certificate minted for one host
pub struct IssuedCert {
    pub host: String,
    pub cert_pem: String,
    /// Leaf first, then the CA certificate
    pub chain: Vec<CertificateDer<'static>>,
    pub server_config: Arc<ServerConfig>,
}

/// Owns the CA key material and the per-host leaf cache
pub struct CertificateAuthority {
    /// Issuer used for signing; carries the CA's subject and key identifier
    issuer: Certificate,
    key: KeyPair,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    leaves: DashMap<String, Arc<IssuedCert>>,
}

impl CertificateAuthority {
    /// Load an existing CA from PEM files.
    ///
    /// The key may be PKCS#1 or PKCS#8. Fails when either file is missing or
    /// unparsable, or when the certificate is not a CA.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        for path in [cert_path, key_path] {
            if !path.exists() {
                return Err(CaError::NotFound(path.to_path_buf()));
            }
        }

        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let key = keys::parse_private_key_pem(&key_pem)?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::InvalidCertificate("no certificate found in PEM".into()))?
            .map_err(|e| CaError::InvalidCertificate(e.to_string()))?;

        ensure_key_matches(&cert_der, &key)?;

        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| CaError::InvalidCertificate(e.to_string()))?;
        if !matches!(params.is_ca, IsCa::Ca(_)) {
            return Err(CaError::InvalidCertificate(
                "certificate is not a CA (basicConstraints cA=false)".into(),
            ));
        }

        // rcgen cannot sign with a parsed certificate directly; rebuild an
        // issuer with the same subject and key.
        let issuer = params
            .self_signed(&key)
            .map_err(|e| CaError::InvalidCertificate(e.to_string()))?;

        tracing::info!(ca_cert_path = ?cert_path, "Loaded CA certificate");

        Ok(Self {
            issuer,
            key,
            cert_pem,
            cert_der,
            leaves: DashMap::new(),
        })
    }

    /// Generate a new self-signed CA and write it to the given paths
    pub fn generate(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        tracing::info!("Generating new CA certificate");

        let key = keys::generate_rsa_key()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        // Backdated to tolerate clock skew between client and proxy
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();
        write_public(cert_path, &cert_pem)?;
        write_private(key_path, &key_pem)?;

        tracing::info!(
            ca_cert_path = ?cert_path,
            ca_key_path = ?key_path,
            "Saved CA certificate to disk"
        );

        let cert_der = cert.der().clone();
        Ok(Self {
            issuer: cert,
            key,
            cert_pem,
            cert_der,
            leaves: DashMap::new(),
        })
    }

    /// Load from disk, falling back to generation when allowed
    pub fn load_or_generate(
        cert_path: &Path,
        key_path: &Path,
        auto_generate: bool,
    ) -> Result<Self, CaError> {
        match Self::load(cert_path, key_path) {
            Ok(ca) => Ok(ca),
            Err(e) if auto_generate => {
                tracing::warn!(error = %e, "Could not load CA, generating a new one");
                Self::generate(cert_path, key_path)
            }
            Err(e) => Err(e),
        }
    }

    /// Leaf certificate for `host` (port ignored), minted on first use.
    ///
    /// Concurrent first requests for the same host may each mint a
    /// certificate; the last insert wins and every result is valid.
    pub fn cert_for_host(&self, host: &str) -> Result<Arc<IssuedCert>, CaError> {
        let host = normalize_host(host);

        if let Some(issued) = self.leaves.get(&host) {
            tracing::debug!(host = %host, "Using cached leaf certificate");
            return Ok(Arc::clone(issued.value()));
        }

        let issued = Arc::new(self.issue_leaf(&host)?);
        self.leaves.insert(host.clone(), Arc::clone(&issued));

        tracing::info!(host = %host, "Issued and cached leaf certificate");
        Ok(issued)
    }

    /// Async wrapper over [`Self::cert_for_host`] that keeps RSA key
    /// generation off the runtime threads.
    pub async fn server_config_for(
        self: &Arc<Self>,
        host: &str,
    ) -> Result<Arc<ServerConfig>, CaError> {
        if let Some(issued) = self.leaves.get(&normalize_host(host)) {
            return Ok(Arc::clone(&issued.server_config));
        }

        let ca = Arc::clone(self);
        let host = host.to_string();
        let issued = tokio::task::spawn_blocking(move || ca.cert_for_host(&host))
            .await
            .map_err(|e| CaError::Generation(format!("certificate task failed: {e}")))??;
        Ok(Arc::clone(&issued.server_config))
    }

    /// CA certificate in PEM form, for installing into client trust stores
    pub fn ca_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Write the CA certificate (never the key) to `path`
    pub fn export_ca_cert(&self, path: &Path) -> Result<(), CaError> {
        write_public(path, &self.cert_pem)?;
        tracing::info!(path = ?path, "Exported CA certificate");
        Ok(())
    }

    pub fn cached_hosts(&self) -> usize {
        self.leaves.len()
    }

    fn issue_leaf(&self, host: &str) -> Result<IssuedCert, CaError> {
        let key = keys::generate_rsa_key()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![subject_alt_name(host)?];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.use_authority_key_identifier_extension = true;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&key, &self.issuer, &self.key)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let chain = vec![cert.der().clone(), self.cert_der.clone()];
        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let mut config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain.clone(), private_key)?;
        // The decrypted stream is served as HTTP/1.1 only
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(IssuedCert {
            host: host.to_string(),
            cert_pem: cert.pem(),
            chain,
            server_config: Arc::new(config),
        })
    }
}

/// Reject a key pair whose public half differs from the certificate's
fn ensure_key_matches(cert_der: &[u8], key: &KeyPair) -> Result<(), CaError> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| CaError::InvalidCertificate(format!("X.509 parse failed: {e}")))?;
    if cert.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
        return Err(CaError::InvalidKey(
            "private key does not match CA certificate".into(),
        ));
    }
    Ok(())
}

fn subject_alt_name(host: &str) -> Result<SanType, CaError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name = host
        .to_string()
        .try_into()
        .map_err(|e| CaError::Generation(format!("invalid host name '{host}': {e:?}")))?;
    Ok(SanType::DnsName(name))
}

fn ensure_parent(path: &Path) -> Result<(), CaError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_public(path: &Path, contents: &str) -> Result<(), CaError> {
    ensure_parent(path)?;
    fs::write(path, contents)?;
    Ok(())
}

/// Write key material readable by the owner only
fn write_private(path: &Path, contents: &str) -> Result<(), CaError> {
    ensure_parent(path)?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    // mode only applies on creation; tighten a pre-existing file too
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents.as_bytes())?;
    Ok(())
}
