//! RSA key material for the certificate authority and issued leaves.

use rcgen::{KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::PrivateKeyDer;

use crate::error::CaError;

pub const RSA_KEY_BITS: usize = 2048;

/// Generate a fresh RSA-2048 key usable for SHA-256 signatures
pub fn generate_rsa_key() -> Result<KeyPair, CaError> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| CaError::Generation(format!("RSA key generation failed: {e}")))?;
    rsa_to_key_pair(&key)
}

/// Parse a PEM private key in PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8
/// (`PRIVATE KEY`) form.
pub fn parse_private_key_pem(pem: &str) -> Result<KeyPair, CaError> {
    let key = rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| CaError::InvalidKey(e.to_string()))?
        .ok_or_else(|| CaError::InvalidKey("no private key found in PEM".into()))?;

    match key {
        PrivateKeyDer::Pkcs1(der) => {
            let rsa = RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der())
                .map_err(|e| CaError::InvalidKey(e.to_string()))?;
            rsa_to_key_pair(&rsa)
        }
        PrivateKeyDer::Pkcs8(der) => match RsaPrivateKey::from_pkcs8_der(der.secret_pkcs8_der()) {
            Ok(rsa) => rsa_to_key_pair(&rsa),
            // not RSA; let rcgen pick the algorithm
            Err(_) => KeyPair::from_pem(pem).map_err(|e| CaError::InvalidKey(e.to_string())),
        },
        _ => Err(CaError::InvalidKey(
            "unsupported private key format, expected PKCS#1 or PKCS#8".into(),
        )),
    }
}

fn rsa_to_key_pair(key: &RsaPrivateKey) -> Result<KeyPair, CaError> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CaError::InvalidKey(e.to_string()))?;
    KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256)
        .map_err(|e| CaError::InvalidKey(e.to_string()))
}
