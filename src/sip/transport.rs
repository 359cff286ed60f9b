//! Transport listeners (C1, §4.1).
//!
//! UDP framing is per-datagram; TCP/TLS framing uses Content-Length plus the
//! empty-line terminator, with a bounded partial-read timeout that closes
//! the connection. Bind failure is fatal at startup; a per-connection send
//! error surfaces to the owning transaction as a transport-level failure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, warn};

use super::transaction::OutboundDatagram;
use super::{Envelope, TransportKind};
use crate::{Error, Result};

const MAX_DATAGRAM: usize = 65_507;

pub struct TransportLayer {
    udp_socket: Option<Arc<UdpSocket>>,
    tls_acceptor: Option<TlsAcceptor>,
    tls_connector: Option<TlsConnector>,
}

impl TransportLayer {
    /// Binds the configured listeners. Bind failure is fatal at startup
    /// (§4.1) — this returns `Err` rather than retrying. The TLS listener is
    /// only bound when a cert/key pair is configured; callers that also want
    /// it must check `SipConfig.transports` before relying on it.
    pub async fn bind(
        host: &str,
        udp_port: u16,
        tcp_port: u16,
        tls_port: u16,
        tls_cert_path: Option<&str>,
        tls_key_path: Option<&str>,
        tls_ca_path: Option<&str>,
    ) -> Result<(Self, TcpListener, Option<TcpListener>)> {
        let udp_addr: SocketAddr = format!("{host}:{udp_port}").parse().map_err(|e| Error::configuration(format!("bad listen host: {e}")))?;
        let udp_socket = UdpSocket::bind(udp_addr).await.map_err(Error::Io)?;
        let tcp_addr: SocketAddr = format!("{host}:{tcp_port}").parse().map_err(|e| Error::configuration(format!("bad listen host: {e}")))?;
        let tcp_listener = TcpListener::bind(tcp_addr).await.map_err(Error::Io)?;

        let (tls_acceptor, tls_listener) = match (tls_cert_path, tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let server_config = load_server_config(cert_path, key_path)?;
                let tls_addr: SocketAddr = format!("{host}:{tls_port}").parse().map_err(|e| Error::configuration(format!("bad listen host: {e}")))?;
                let listener = TcpListener::bind(tls_addr).await.map_err(Error::Io)?;
                (Some(TlsAcceptor::from(Arc::new(server_config))), Some(listener))
            }
            _ => (None, None),
        };

        let tls_connector = tls_ca_path.map(load_client_config).transpose()?.map(|c| TlsConnector::from(Arc::new(c)));

        Ok((Self { udp_socket: Some(Arc::new(udp_socket)), tls_acceptor, tls_connector }, tcp_listener, tls_listener))
    }

    /// The TLS acceptor bound by `bind`, if a cert/key pair was configured.
    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls_acceptor.clone()
    }

    /// Spawns the UDP receive loop (inbound) and the shared outbound sender
    /// task (driven by the transaction manager's retransmission timers and
    /// one-shot sends alike). TCP/TLS datagrams open a short-lived outbound
    /// connection, write the message, then read it for the response.
    pub fn spawn_udp(
        &self,
        inbound_tx: mpsc::UnboundedSender<Envelope>,
        mut out_rx: mpsc::UnboundedReceiver<OutboundDatagram>,
        partial_read_timeout: Duration,
    ) {
        let socket = match &self.udp_socket {
            Some(s) => s.clone(),
            None => return,
        };
        let tls_connector = self.tls_connector.clone();

        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, peer)) => match rsip::SipMessage::try_from(&buf[..len]) {
                        Ok(message) => {
                            let _ = inbound_tx.send(Envelope { message, peer, transport: TransportKind::Udp });
                        }
                        Err(e) => warn!("dropping unparsable UDP datagram from {peer}: {e}"),
                    },
                    Err(e) => {
                        error!("UDP recv error: {e}");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(datagram) = out_rx.recv().await {
                match datagram.transport {
                    TransportKind::Udp => {
                        if let Err(e) = socket.send_to(&datagram.bytes, datagram.destination).await {
                            warn!("UDP send error to {}: {e}", datagram.destination);
                        }
                    }
                    TransportKind::Tcp => {
                        let tx = inbound_tx.clone();
                        let timeout = partial_read_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = send_and_drain_tcp(datagram.destination, &datagram.bytes, tx, timeout).await {
                                warn!("TCP send error to {}: {e}", datagram.destination);
                            }
                        });
                    }
                    TransportKind::Tls => {
                        let Some(connector) = tls_connector.clone() else {
                            warn!("dropping outbound TLS datagram to {}: no CA configured", datagram.destination);
                            continue;
                        };
                        let tx = inbound_tx.clone();
                        let timeout = partial_read_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = send_and_drain_tls(connector, datagram.destination, &datagram.bytes, tx, timeout).await {
                                warn!("TLS send error to {}: {e}", datagram.destination);
                            }
                        });
                    }
                }
            }
        });
    }

    /// Spawns the TCP accept loop; each connection gets its own framing task
    /// (Content-Length based, §4.1).
    pub fn spawn_tcp(listener: TcpListener, inbound_tx: mpsc::UnboundedSender<Envelope>, partial_read_timeout: Duration) {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let tx = inbound_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = read_framed_tcp(stream, peer, TransportKind::Tcp, tx, partial_read_timeout).await {
                                debug!("TCP connection from {peer} closed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("TCP accept error: {e}");
                        break;
                    }
                }
            }
        });
    }

    /// Spawns the TLS accept loop, performing the handshake before framing
    /// each connection identically to the plain-TCP listener.
    pub fn spawn_tls(listener: TcpListener, acceptor: TlsAcceptor, inbound_tx: mpsc::UnboundedSender<Envelope>, partial_read_timeout: Duration) {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let tx = inbound_tx.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    if let Err(e) = read_framed_tcp(tls_stream, peer, TransportKind::Tls, tx, partial_read_timeout).await {
                                        debug!("TLS connection from {peer} closed: {e}");
                                    }
                                }
                                Err(e) => warn!("TLS handshake with {peer} failed: {e}"),
                            }
                        });
                    }
                    Err(e) => {
                        error!("TLS accept error: {e}");
                        break;
                    }
                }
            }
        });
    }
}

fn load_server_config(cert_path: &str, key_path: &str) -> Result<ServerConfig> {
    let cert_bytes = std::fs::read(cert_path).map_err(Error::Io)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_bytes.as_slice()).collect::<std::result::Result<_, _>>().map_err(|e| Error::configuration(format!("bad TLS cert {cert_path}: {e}")))?;
    let key_bytes = std::fs::read(key_path).map_err(Error::Io)?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(|e| Error::configuration(format!("bad TLS key {key_path}: {e}")))?
        .ok_or_else(|| Error::configuration(format!("{key_path} contains no private key")))?;
    ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key).map_err(|e| Error::configuration(format!("invalid TLS identity: {e}")))
}

fn load_client_config(ca_path: &str) -> Result<ClientConfig> {
    let ca_bytes = std::fs::read(ca_path).map_err(Error::Io)?;
    let ca_certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut ca_bytes.as_slice()).collect::<std::result::Result<_, _>>().map_err(|e| Error::configuration(format!("bad TLS CA bundle {ca_path}: {e}")))?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert).map_err(|e| Error::configuration(format!("bad TLS CA bundle {ca_path}: {e}")))?;
    }
    Ok(ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
}

/// Connects to `destination`, writes `bytes`, then reads whatever framed
/// responses arrive on the same connection until it closes — matches the
/// connection-oriented response delivery TCP/TLS peers expect (§4.1).
async fn send_and_drain_tcp(destination: SocketAddr, bytes: &[u8], inbound_tx: mpsc::UnboundedSender<Envelope>, partial_read_timeout: Duration) -> Result<()> {
    let mut stream = TcpStream::connect(destination).await.map_err(Error::Io)?;
    write_tcp_message(&mut stream, bytes).await?;
    read_framed_tcp(stream, destination, TransportKind::Tcp, inbound_tx, partial_read_timeout).await
}

async fn send_and_drain_tls(
    connector: TlsConnector,
    destination: SocketAddr,
    bytes: &[u8],
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    partial_read_timeout: Duration,
) -> Result<()> {
    let tcp_stream = TcpStream::connect(destination).await.map_err(Error::Io)?;
    let server_name = ServerName::from(destination.ip());
    let mut tls_stream = connector.connect(server_name, tcp_stream).await.map_err(Error::Io)?;
    write_tcp_message(&mut tls_stream, bytes).await?;
    read_framed_tcp(tls_stream, destination, TransportKind::Tls, inbound_tx, partial_read_timeout).await
}

async fn read_framed_tcp<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    peer: SocketAddr,
    transport: TransportKind,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    partial_read_timeout: Duration,
) -> Result<()> {
    let mut buf: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; 4096];
    loop {
        let header_end = find_header_terminator(&buf);
        if let Some(end) = header_end {
            if let Some(content_length) = parse_content_length(&buf[..end]) {
                let total_needed = end + 4 + content_length;
                if buf.len() >= total_needed {
                    let message_bytes = buf[..total_needed].to_vec();
                    buf.drain(..total_needed);
                    match rsip::SipMessage::try_from(message_bytes.as_slice()) {
                        Ok(message) => {
                            let _ = inbound_tx.send(Envelope { message, peer, transport });
                        }
                        Err(e) => warn!("dropping unparsable {transport} message from {peer}: {e}"),
                    }
                    continue;
                }
            }
        }

        let read_result = tokio::time::timeout(partial_read_timeout, stream.read(&mut read_buf)).await;
        match read_result {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => buf.extend_from_slice(&read_buf[..n]),
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => return Err(Error::timeout("TCP partial read exceeded bound")),
        }
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(headers);
    text.lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
}

/// Writes a single framed message over an already-connected stream, used for
/// outbound requests on both plain-TCP and TLS connections.
pub async fn write_tcp_message<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes).await.map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_header_terminator() {
        let buf = b"INVITE sip:a SIP/2.0\r\nContent-Length: 4\r\n\r\nbody";
        assert_eq!(find_header_terminator(buf), Some(41));
    }

    #[test]
    fn parses_content_length_case_insensitively() {
        let headers = b"INVITE sip:a SIP/2.0\r\ncontent-length: 12\r\n";
        assert_eq!(parse_content_length(headers), Some(12));
    }

    #[test]
    fn missing_content_length_is_none() {
        let headers = b"INVITE sip:a SIP/2.0\r\nVia: foo\r\n";
        assert_eq!(parse_content_length(headers), None);
    }
}
