//! TCP connection setup for identity probes.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::time::Duration;

/// Low-level transport abstraction for opening TCP connections.
pub trait Transport {
    fn connect(&self, address: SocketAddr, timeout: Duration) -> BrowserResult<TcpStream>;

    /// Tries each address in order and returns the first connection that succeeds.
    fn connect_any(&self, addresses: &[SocketAddr], timeout: Duration) -> BrowserResult<TcpStream> {
        let mut last_error = BrowserError::new(
            "net.transport.no_addresses",
            "no addresses to connect to",
        );
        for address in addresses {
            match self.connect(*address, timeout) {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    tracing::debug!(%address, %error, "connect attempt failed");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }
}

/// Standard library TCP transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn connect(&self, address: SocketAddr, timeout: Duration) -> BrowserResult<TcpStream> {
        let stream = TcpStream::connect_timeout(&address, timeout).map_err(|error| {
            BrowserError::new(
                "net.transport.connect_failed",
                format!("failed to connect to `{address}`: {error}"),
            )
        })?;

        stream.set_read_timeout(Some(timeout)).map_err(|error| {
            BrowserError::new(
                "net.transport.read_timeout_failed",
                format!("failed to set read timeout for `{address}`: {error}"),
            )
        })?;

        stream.set_write_timeout(Some(timeout)).map_err(|error| {
            BrowserError::new(
                "net.transport.write_timeout_failed",
                format!("failed to set write timeout for `{address}`: {error}"),
            )
        })?;

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::TcpTransport;
    use super::Transport;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn connect_any_skips_unreachable_addresses() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|error| panic!("{error}"));
        let live = listener.local_addr().unwrap_or_else(|error| panic!("{error}"));

        // Bind then drop to obtain a port with nothing listening.
        let dead = TcpListener::bind("127.0.0.1:0")
            .and_then(|socket| socket.local_addr())
            .unwrap_or_else(|error| panic!("{error}"));

        let stream = TcpTransport.connect_any(&[dead, live], Duration::from_secs(2));
        assert!(stream.is_ok());
    }

    #[test]
    fn empty_address_list_is_an_error() {
        let stream = TcpTransport.connect_any(&[], Duration::from_secs(1));
        assert_eq!(
            stream.map(|_| ()).map_err(|error| error.code),
            Err("net.transport.no_addresses")
        );
    }
}
