//! Certificate authority used for HTTPS interception.

mod authority;
mod keys;

pub use authority::{CertificateAuthority, IssuedCert, CA_COMMON_NAME};
pub use keys::{generate_rsa_key, parse_private_key_pem, RSA_KEY_BITS};
