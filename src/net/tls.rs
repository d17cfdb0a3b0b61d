//! Transport security via rustls (pure Rust, no OpenSSL).
//!
//! A [`TlsContext`] is configured once at startup and shared by every socket
//! it secures; the per-connection [`TlsSession`] drives a nonblocking
//! `rustls::Connection` over the raw descriptor. Client contexts trust the
//! Mozilla CA roots; server contexts load a PEM chain and key.

use crate::error::{NetError, NetResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

enum ContextKind {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

/// Shared TLS configuration. Cheap to clone; configure once at startup.
#[derive(Clone)]
pub struct TlsContext {
    kind: Arc<ContextKind>,
}

impl TlsContext {
    /// Client-side context with Mozilla CA roots.
    pub fn client() -> NetResult<TlsContext> {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|err| NetError::Tls(format!("protocol versions: {}", err)))?
                .with_root_certificates(root_store)
                .with_no_client_auth();
        Ok(TlsContext {
            kind: Arc::new(ContextKind::Client(Arc::new(config))),
        })
    }

    /// Server-side context from PEM-encoded certificate chain and key.
    pub fn server(cert_pem: &[u8], key_pem: &[u8]) -> NetResult<TlsContext> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut io::Cursor::new(cert_pem))
                .collect::<Result<_, _>>()
                .map_err(|err| NetError::Tls(format!("certificate parse: {}", err)))?;
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut io::Cursor::new(key_pem))
                .map_err(|err| NetError::Tls(format!("key parse: {}", err)))?
                .ok_or_else(|| NetError::Tls("no private key in pem".to_string()))?;
        let config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|err| NetError::Tls(format!("protocol versions: {}", err)))?
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|err| NetError::Tls(format!("certificate: {}", err)))?;
        Ok(TlsContext {
            kind: Arc::new(ContextKind::Server(Arc::new(config))),
        })
    }

    /// Open a session in the requested role. The role must match the
    /// context kind; a client handshake needs the peer hostname for SNI.
    pub(crate) fn new_session(&self, client: bool, server_name: Option<&str>) -> NetResult<TlsSession> {
        let conn = match (&*self.kind, client) {
            (ContextKind::Client(config), true) => {
                let host = server_name.unwrap_or("localhost").to_string();
                let name = ServerName::try_from(host.clone())
                    .map_err(|_| NetError::Tls(format!("invalid hostname: {}", host)))?;
                Connection::Client(
                    ClientConnection::new(config.clone(), name)
                        .map_err(|err| NetError::Tls(err.to_string()))?,
                )
            }
            (ContextKind::Server(config), false) => Connection::Server(
                ServerConnection::new(config.clone())
                    .map_err(|err| NetError::Tls(err.to_string()))?,
            ),
            (ContextKind::Client(_), false) => {
                return Err(NetError::Tls("client context used in server role".to_string()))
            }
            (ContextKind::Server(_), true) => {
                return Err(NetError::Tls("server context used in client role".to_string()))
            }
        };
        Ok(TlsSession { conn })
    }
}

/// Per-connection TLS state machine over a nonblocking stream.
pub(crate) struct TlsSession {
    conn: Connection,
}

impl TlsSession {
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Advance the handshake as far as the transport allows; `WouldBlock`
    /// propagates when it stalls.
    pub fn complete_io(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                self.conn.write_tls(stream)?;
                continue;
            }
            if self.conn.wants_read() {
                let n = self.conn.read_tls(stream)?;
                if n == 0 {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
                }
                self.conn
                    .process_new_packets()
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                continue;
            }
            break;
        }
        while self.conn.wants_write() {
            self.conn.write_tls(stream)?;
        }
        Ok(())
    }

    /// Read decrypted plaintext, pumping ciphertext from the transport as
    /// needed. Returns 0 at a clean TLS close.
    pub fn read(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
            // No plaintext buffered; pull more records off the wire.
            match self.conn.read_tls(stream) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                    // Handshake traffic may need responses before plaintext
                    // flows.
                    if self.conn.wants_write() {
                        match self.conn.write_tls(stream) {
                            Ok(_) => {}
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                            Err(err) => return Err(err),
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Accept plaintext into the session's outgoing buffer.
    pub fn buffer_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        self.conn.writer().write(data)
    }

    /// Write buffered ciphertext to the transport until drained or stalled.
    pub fn pump_writes(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(stream)?;
        }
        Ok(())
    }

    /// Best-effort close_notify.
    pub fn close(&mut self, stream: &mut TcpStream) {
        self.conn.send_close_notify();
        let _ = self.pump_writes(stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (Vec<u8>, Vec<u8>) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (
            cert.cert.pem().into_bytes(),
            cert.key_pair.serialize_pem().into_bytes(),
        )
    }

    #[test]
    fn client_context_builds() {
        assert!(TlsContext::client().is_ok());
    }

    #[test]
    fn server_context_from_pem() {
        let (cert, key) = self_signed();
        let context = TlsContext::server(&cert, &key).unwrap();
        assert!(context.new_session(false, None).is_ok());
        assert!(context.new_session(true, Some("localhost")).is_err());
    }

    #[test]
    fn client_context_rejects_server_role() {
        let context = TlsContext::client().unwrap();
        assert!(context.new_session(false, None).is_err());
        assert!(context.new_session(true, Some("example.com")).is_ok());
    }
}
