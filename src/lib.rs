//! HTTP/HTTPS traffic capture proxy.
//!
//! Plain HTTP is forwarded and recorded, CONNECT is either tunneled or
//! terminated with a locally issued certificate, and every recorded
//! exchange lands in a bounded in-memory store that can be filtered,
//! summarized, and subscribed to.

pub mod capture;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod tls;

pub use capture::{CaptureStats, CaptureStore, CapturedRequest, FilterOptions, ListenerHandle};
pub use config::Config;
pub use error::{ProxyError, Result};
pub use server::Server;
pub use tls::CertificateAuthority;
