//! rustls-backed certificate inspection and the live identity probe.

use crate::certificate::identity_from_der;
use crate::dns::IpResolver;
use crate::tls::TrustStoreMode;
use crate::tls::classify_rustls_error;
use crate::transport::Transport;
use crate::url::BrowserUrl;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_core::Timestamp;
use pd_trust::CommittedNavigation;
use pd_trust::DomainKey;
use pd_trust::IdentitySnapshot;
use pd_trust::TlsErrorKind;
use pd_trust::TlsErrorReport;
use rustls::ClientConfig;
use rustls::ClientConnection;
use rustls::DigitallySignedStruct;
use rustls::Error as RustlsError;
use rustls::RootCertStore;
use rustls::SignatureScheme;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::danger::ServerCertVerified;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::ServerName;
use rustls::pki_types::UnixTime;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// What the platform knows about a server after verifying its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInspection {
    /// `Err` when the leaf certificate could not be read.
    pub identity: BrowserResult<IdentitySnapshot>,
    /// Primary verification error, `None` when the chain is trusted.
    pub error: Option<TlsErrorKind>,
}

/// The platform callback an inspection turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    TlsError(TlsErrorReport),
    Committed(CommittedNavigation),
}

impl TlsInspection {
    fn from_chain(
        chain: &[Vec<u8>],
        ip_addresses: BTreeSet<String>,
        verdict: Result<(), TlsErrorKind>,
    ) -> Self {
        let identity = match chain.first() {
            Some(leaf) => identity_from_der(leaf, ip_addresses),
            None => Err(BrowserError::new(
                "net.cert.chain_empty",
                "server presented no certificates",
            )),
        };

        // A certificate that cannot be read is never treated as trusted.
        let error = match (&identity, verdict) {
            (_, Err(kind)) => Some(kind),
            (Err(_), Ok(())) => Some(TlsErrorKind::Invalid),
            (Ok(_), Ok(())) => None,
        };
        Self { identity, error }
    }

    pub fn into_event(self, host: &str, domain: Option<DomainKey>) -> PlatformEvent {
        match self.error {
            Some(error) => PlatformEvent::TlsError(TlsErrorReport {
                host: host.to_owned(),
                error,
                identity: self.identity.ok(),
            }),
            None => PlatformEvent::Committed(CommittedNavigation {
                host: host.to_owned(),
                domain,
                identity: self.identity,
            }),
        }
    }
}

/// Verifies presented chains against the configured trust anchors.
#[derive(Debug, Clone)]
pub struct CertificateInspector {
    verifier: Arc<WebPkiServerVerifier>,
}

impl CertificateInspector {
    pub fn new(mode: TrustStoreMode) -> BrowserResult<Self> {
        Self::with_roots(root_store(mode)?)
    }

    pub fn with_roots(roots: RootCertStore) -> BrowserResult<Self> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|error| {
                BrowserError::new(
                    "net.tls.verifier_build_failed",
                    format!("failed to build rustls verifier: {error}"),
                )
            })?;
        Ok(Self { verifier })
    }

    /// Runs the platform verifier over a DER chain (leaf first).
    pub fn verify(
        &self,
        chain: &[Vec<u8>],
        host: &str,
        now: Timestamp,
    ) -> Result<(), TlsErrorKind> {
        let Some((leaf, intermediates)) = chain.split_first() else {
            return Err(TlsErrorKind::Invalid);
        };
        let server_name = ServerName::try_from(host).map_err(|_| TlsErrorKind::IdMismatch)?;
        let intermediates: Vec<CertificateDer<'_>> = intermediates
            .iter()
            .map(|der| CertificateDer::from(der.as_slice()))
            .collect();
        let seconds = u64::try_from(now.timestamp()).unwrap_or_default();

        self.verifier
            .verify_server_cert(
                &CertificateDer::from(leaf.as_slice()),
                &intermediates,
                &server_name,
                &[],
                UnixTime::since_unix_epoch(Duration::from_secs(seconds)),
            )
            .map(|_| ())
            .map_err(|error| classify_rustls_error(&error))
    }

    pub fn inspect(
        &self,
        chain: &[Vec<u8>],
        host: &str,
        ip_addresses: BTreeSet<String>,
        now: Timestamp,
    ) -> TlsInspection {
        let verdict = self.verify(chain, host, now);
        TlsInspection::from_chain(chain, ip_addresses, verdict)
    }
}

#[derive(Debug)]
struct CapturedChain {
    chain: Vec<Vec<u8>>,
    verdict: Result<(), TlsErrorKind>,
}

/// Records the presented chain and the platform's verdict, then returns that
/// verdict unchanged.
#[derive(Debug)]
struct CapturingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    captured: Mutex<Option<CapturedChain>>,
}

impl CapturingVerifier {
    fn take(&self) -> Option<CapturedChain> {
        self.captured.lock().ok().and_then(|mut captured| captured.take())
    }
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let result =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);

        let chain = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|der| der.as_ref().to_vec())
            .collect();
        let verdict = match &result {
            Ok(_) => Ok(()),
            Err(error) => Err(classify_rustls_error(error)),
        };
        if let Ok(mut captured) = self.captured.lock() {
            *captured = Some(CapturedChain { chain, verdict });
        }
        result
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Connects to the URL's host, runs a TLS handshake and reports what was seen.
///
/// No application data is sent; the connection is closed right after the
/// handshake settles.
pub fn probe_identity(
    url: &BrowserUrl,
    inspector: &CertificateInspector,
    resolver: &dyn IpResolver,
    transport: &dyn Transport,
    timeout: Duration,
) -> BrowserResult<TlsInspection> {
    if !url.scheme().is_secure() {
        return Err(BrowserError::new(
            "net.probe.scheme_insecure",
            format!("`{}` is not an https URL", url.as_str()),
        ));
    }

    let addresses = resolver.resolve(url.host(), url.port())?;
    let ip_addresses: BTreeSet<String> = addresses
        .iter()
        .map(|address| address.ip().to_string())
        .collect();
    let mut stream = transport.connect_any(&addresses, timeout)?;

    let verifier = Arc::new(CapturingVerifier {
        inner: inspector.verifier.clone(),
        captured: Mutex::new(None),
    });
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|error| {
            BrowserError::new(
                "net.tls.config_versions_invalid",
                format!("failed to configure TLS protocol versions: {error}"),
            )
        })?
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone())
        .with_no_client_auth();

    let server_name = ServerName::try_from(url.host().to_owned()).map_err(|error| {
        BrowserError::new(
            "net.tls.server_name_invalid",
            format!("invalid TLS server name `{}`: {error}", url.host()),
        )
    })?;
    let mut connection = ClientConnection::new(Arc::new(config), server_name).map_err(|error| {
        BrowserError::new(
            "net.tls.connection_init_failed",
            format!("failed to initialize TLS connection for `{}`: {error}", url.host()),
        )
    })?;

    let mut handshake_error = None;
    while connection.is_handshaking() {
        if let Err(error) = connection.complete_io(&mut stream) {
            handshake_error = Some(error);
            break;
        }
    }
    if handshake_error.is_none() {
        connection.send_close_notify();
        let _ = connection.complete_io(&mut stream);
    }

    let Some(captured) = verifier.take() else {
        let detail = handshake_error
            .map(|error| error.to_string())
            .unwrap_or_else(|| "no certificate presented".to_owned());
        return Err(BrowserError::new(
            "net.probe.handshake_failed",
            format!("TLS handshake with `{}` failed before verification: {detail}", url.host()),
        ));
    };

    tracing::debug!(
        host = url.host(),
        chain_len = captured.chain.len(),
        verdict = ?captured.verdict,
        "identity probed"
    );
    Ok(TlsInspection::from_chain(&captured.chain, ip_addresses, captured.verdict))
}

fn root_store(mode: TrustStoreMode) -> BrowserResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if mode == TrustStoreMode::WebPkiAndOs {
        let native = rustls_native_certs::load_native_certs();
        if native.certs.is_empty() && !native.errors.is_empty() {
            let details = native
                .errors
                .iter()
                .map(std::string::ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(BrowserError::new(
                "net.tls.os_roots_load_failed",
                format!("failed to load operating-system roots: {details}"),
            ));
        }

        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        tracing::debug!(added, ignored, "operating-system roots merged");
    }

    Ok(roots)
}
