//! Upstream connections: TCP, then TLS against the system trust store.
//!
//! The host is always the route's pinned upstream — the relay never passes
//! anything agent-controlled here. TLS verification uses the platform's
//! native root certificates; the one plaintext path exists for loopback
//! integration tests and is off in every production route.

use crate::RouteConfig;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// One connected upstream socket.
pub enum Upstream {
    /// Plaintext TCP. Tests only.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Upstream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Upstream::Plain(s) => s.read(buf),
            Upstream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Upstream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Upstream::Plain(s) => s.write(buf),
            Upstream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Upstream::Plain(s) => s.flush(),
            Upstream::Tls(s) => s.flush(),
        }
    }
}

fn tls_client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    Arc::clone(CONFIG.get_or_init(|| {
        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            // Individual unparsable platform certs are skipped; an empty
            // store just means every handshake fails verification, which
            // is the correct failure mode.
            let _ = roots.add(cert);
        }
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }))
}

/// Connect to the route's pinned upstream with the given socket deadline.
pub fn connect(route: &RouteConfig, timeout: Duration) -> std::io::Result<Upstream> {
    let addr = (route.upstream_host.as_str(), route.upstream_port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "upstream did not resolve")
        })?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;

    if !route.upstream_tls {
        return Ok(Upstream::Plain(stream));
    }

    let server_name = ServerName::try_from(route.upstream_host.clone())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid upstream name"))?;
    let conn = ClientConnection::new(tls_client_config(), server_name)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionAborted, e.to_string()))?;
    Ok(Upstream::Tls(Box::new(StreamOwned::new(conn, stream))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn test_route(port: u16) -> RouteConfig {
        RouteConfig {
            provider: "test".into(),
            listen_port: 0,
            upstream_host: "127.0.0.1".into(),
            upstream_port: port,
            auth_header: "bearer".into(),
            secret: "sk".into(),
            upstream_tls: false,
        }
    }

    #[test]
    fn plaintext_connect_works_for_tests() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let upstream = connect(&test_route(port), Duration::from_secs(5)).unwrap();
        assert!(matches!(upstream, Upstream::Plain(_)));
    }

    #[test]
    fn connect_to_closed_port_fails() {
        // Bind then drop to find a port that is very likely closed.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        assert!(connect(&test_route(port), Duration::from_millis(200)).is_err());
    }
}
