//! Navigation URL parsing and the host/domain keys derived from it.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_trust::DomainKey;
use url::Host;
use url::Url;

/// Supported application-level URL schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn is_secure(self) -> bool {
        matches!(self, Self::Https)
    }
}

/// A navigation target reduced to what trust evaluation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserUrl {
    parsed: Url,
    scheme: Scheme,
    host: String,
    port: u16,
    is_ip_literal: bool,
}

impl BrowserUrl {
    pub fn parse(input: &str) -> BrowserResult<Self> {
        let mut parsed = Url::parse(input).map_err(|error| {
            BrowserError::new(
                "net.url.invalid",
                format!("failed to parse URL `{input}`: {error}"),
            )
        })?;

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(BrowserError::new(
                "net.url.credentials_disallowed",
                "URL userinfo (`username:password@`) is not allowed",
            ));
        }

        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(BrowserError::new(
                    "net.url.scheme_unsupported",
                    format!("unsupported scheme `{other}`"),
                ));
            }
        };

        let (host, is_ip_literal) = match parsed.host() {
            Some(Host::Domain(domain)) => (domain.to_ascii_lowercase(), false),
            Some(Host::Ipv4(address)) => (address.to_string(), true),
            Some(Host::Ipv6(address)) => (address.to_string(), true),
            None => {
                return Err(BrowserError::new("net.url.host_missing", "URL must include a host"));
            }
        };

        let port = parsed.port_or_known_default().ok_or_else(|| {
            BrowserError::new(
                "net.url.port_missing",
                "unable to determine effective port for URL",
            )
        })?;

        parsed.set_fragment(None);

        Ok(Self {
            parsed,
            scheme,
            host,
            port,
            is_ip_literal,
        })
    }

    pub fn as_str(&self) -> &str {
        self.parsed.as_str()
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Lowercase host without brackets, as matched against certificate names.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ip_literal(&self) -> bool {
        self.is_ip_literal
    }

    /// Key of the per-domain settings record for this navigation.
    pub fn settings_domain(&self) -> DomainKey {
        DomainKey::new(&self.host)
    }
}
