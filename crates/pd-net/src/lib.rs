//! Platform adapters feeding the trust engine: URL and host handling, IP
//! resolution, certificate reading, and rustls verification.

pub mod certificate;
pub mod dns;
pub mod tls;
#[cfg(feature = "tls-rustls")]
pub mod tls_backend;
pub mod transport;
pub mod url;

pub use certificate::identity_from_der;
pub use dns::IpResolver;
pub use dns::SystemIpResolver;
#[cfg(feature = "tls-rustls")]
pub use tls::classify_rustls_error;
pub use tls::TrustStoreMode;
#[cfg(feature = "tls-rustls")]
pub use tls_backend::CertificateInspector;
#[cfg(feature = "tls-rustls")]
pub use tls_backend::PlatformEvent;
#[cfg(feature = "tls-rustls")]
pub use tls_backend::TlsInspection;
#[cfg(feature = "tls-rustls")]
pub use tls_backend::probe_identity;
pub use transport::TcpTransport;
pub use transport::Transport;
pub use url::BrowserUrl;
pub use url::Scheme;
