//! Host to IP-set resolution.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;

/// Name resolution abstraction.
pub trait IpResolver {
    fn resolve(&self, host: &str, port: u16) -> BrowserResult<Vec<SocketAddr>>;

    /// Textual addresses the host currently resolves to.
    fn ip_set(&self, host: &str) -> BrowserResult<BTreeSet<String>> {
        Ok(self
            .resolve(host, 443)?
            .into_iter()
            .map(|address| address.ip().to_string())
            .collect())
    }
}

/// Uses the operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIpResolver;

impl IpResolver for SystemIpResolver {
    fn resolve(&self, host: &str, port: u16) -> BrowserResult<Vec<SocketAddr>> {
        let addresses: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|error| {
                BrowserError::new(
                    "net.dns.resolve_failed",
                    format!("failed to resolve `{host}`: {error}"),
                )
            })?
            .collect();

        if addresses.is_empty() {
            return Err(BrowserError::new(
                "net.dns.no_results",
                format!("resolver returned no addresses for `{host}`"),
            ));
        }

        tracing::debug!(host, count = addresses.len(), "host resolved");
        Ok(addresses)
    }
}
