//! Trust-anchor selection and classification of TLS verifier failures.

#[cfg(feature = "tls-rustls")]
use pd_trust::TlsErrorKind;
#[cfg(feature = "tls-rustls")]
use rustls::CertificateError;
#[cfg(feature = "tls-rustls")]
use rustls::Error as RustlsError;

/// Controls which trust anchors are used for server certificate verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrustStoreMode {
    /// Use only the embedded Mozilla/WebPKI roots.
    #[default]
    WebPkiOnly,
    /// Use WebPKI roots and merge operating-system roots (enterprise/local CAs).
    WebPkiAndOs,
}

/// Maps a rustls verification failure onto the platform's primary error kind.
///
/// Anything that is not a recognised certificate problem is `Invalid`, which
/// still prompts.
#[cfg(feature = "tls-rustls")]
pub fn classify_rustls_error(error: &RustlsError) -> TlsErrorKind {
    match error {
        RustlsError::InvalidCertificate(certificate) => classify_certificate_error(certificate),
        _ => TlsErrorKind::Invalid,
    }
}

#[cfg(feature = "tls-rustls")]
fn classify_certificate_error(error: &CertificateError) -> TlsErrorKind {
    match error {
        CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
            TlsErrorKind::Expired
        }
        CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
            TlsErrorKind::NotYetValid
        }
        CertificateError::UnknownIssuer => TlsErrorKind::UntrustedIssuer,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
            TlsErrorKind::IdMismatch
        }
        _ => TlsErrorKind::Invalid,
    }
}
