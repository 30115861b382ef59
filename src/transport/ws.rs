//! WebSocket connector built on tungstenite.
//!
//! The TCP connect and the handshake are bounded by the connector timeout;
//! afterwards the stream is switched to non-blocking so `poll_event` never
//! stalls the pipeline loop. `wss://` needs the `tls` feature (rustls with
//! webpki roots).

use anyhow::{anyhow, Context, Result};
use std::borrow::Cow;
use std::io;
use std::net::TcpStream;
use std::time::Duration;
use tungstenite::handshake::client::Response;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use super::channel::{Connection, ConnectionEvent, Connector};
use super::protocol::CLOSE_ABNORMAL;

/// Close code reported when the peer closes without a status.
const CLOSE_NO_STATUS: u16 = 1005;

/// Upper bound for the TCP connect, and separately for each handshake read/write.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

type WsSocket = WebSocket<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct WsConnector {
    timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    /// A zero timeout falls back to the default.
    pub fn with_timeout(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            timeout
        };
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Connector for WsConnector {
    type Connection = WsConnection;

    fn connect(&mut self, endpoint: &Url) -> Result<WsConnection> {
        if endpoint.scheme() == "wss" && !cfg!(feature = "tls") {
            return Err(anyhow!(
                "{} requires the 'tls' feature. Recompile with: cargo build --features tls",
                endpoint
            ));
        }
        let stream = open_stream(endpoint, self.timeout)?;
        let (mut socket, response) = handshake(endpoint, stream)?;
        log::debug!(
            "WsConnector: {} upgraded with status {}",
            endpoint,
            response.status()
        );
        set_nonblocking(&mut socket).context("failed to make websocket stream non-blocking")?;
        Ok(WsConnection { socket })
    }
}

fn open_stream(endpoint: &Url, timeout: Duration) -> Result<TcpStream> {
    let addrs = endpoint
        .socket_addrs(|| None)
        .with_context(|| format!("failed to resolve {}", endpoint))?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(timeout))
                    .and_then(|()| stream.set_write_timeout(Some(timeout)))
                    .context("failed to set handshake timeouts")?;
                return Ok(stream);
            }
            Err(err) => {
                log::debug!("WsConnector: connect to {} failed: {}", addr, err);
                last_err = Some(err);
            }
        }
    }
    Err(match last_err {
        Some(err) => anyhow::Error::new(err).context(format!("failed to connect to {}", endpoint)),
        None => anyhow!("{} resolved to no addresses", endpoint),
    })
}

#[cfg(feature = "tls")]
fn handshake(endpoint: &Url, stream: TcpStream) -> Result<(WsSocket, Response)> {
    tungstenite::client_tls_with_config(endpoint.as_str(), stream, None, Some(tls_connector()))
        .map_err(|e| anyhow!("websocket handshake with {} failed: {}", endpoint, e))
}

#[cfg(not(feature = "tls"))]
fn handshake(endpoint: &Url, stream: TcpStream) -> Result<(WsSocket, Response)> {
    tungstenite::client(endpoint.as_str(), MaybeTlsStream::Plain(stream))
        .map_err(|e| anyhow!("websocket handshake with {} failed: {}", endpoint, e))
}

#[cfg(feature = "tls")]
fn tls_connector() -> tungstenite::Connector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tungstenite::Connector::Rustls(std::sync::Arc::new(config))
}

fn set_nonblocking(socket: &mut WsSocket) -> io::Result<()> {
    match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_nonblocking(true),
        #[cfg(feature = "tls")]
        MaybeTlsStream::Rustls(stream) => stream.get_ref().set_nonblocking(true),
        #[allow(unreachable_patterns)]
        _ => Ok(()),
    }
}

pub struct WsConnection {
    socket: WsSocket,
}

fn would_block(err: &tungstenite::Error) -> bool {
    matches!(err, tungstenite::Error::Io(io_err) if io_err.kind() == io::ErrorKind::WouldBlock)
}

fn reset_without_close(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
            )
    )
}

impl Connection for WsConnection {
    fn send_text(&mut self, text: &str) -> Result<()> {
        match self.socket.send(Message::Text(text.to_string())) {
            Ok(()) => Ok(()),
            // Buffered by tungstenite; flushed on the next poll.
            Err(err) if would_block(&err) => Ok(()),
            Err(err) => Err(anyhow::Error::new(err).context("websocket send failed")),
        }
    }

    fn poll_event(&mut self) -> Result<Option<ConnectionEvent>> {
        loop {
            match self.socket.read() {
                Ok(Message::Text(text)) => return Ok(Some(ConnectionEvent::Text(text))),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    return Ok(Some(ConnectionEvent::Closed { code, reason }));
                }
                Ok(Message::Binary(data)) => {
                    log::debug!("WsConnection: ignoring {} byte binary message", data.len());
                }
                Ok(_) => {}
                Err(err) if would_block(&err) => {
                    if let Err(err) = self.socket.flush() {
                        if !would_block(&err) {
                            return Err(anyhow::Error::new(err).context("websocket flush failed"));
                        }
                    }
                    return Ok(None);
                }
                Err(err) if reset_without_close(&err) => {
                    return Ok(Some(ConnectionEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "connection closed".to_string(),
                    }));
                }
                Err(err) => return Err(anyhow::Error::new(err).context("websocket read failed")),
            }
        }
    }

    fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        match self.socket.close(Some(frame)) {
            Ok(()) => {}
            Err(err) if would_block(&err) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {}
            Err(err) => return Err(anyhow::Error::new(err).context("websocket close failed")),
        }
        match self.socket.flush() {
            Ok(()) => Ok(()),
            Err(err) if would_block(&err) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(err) => Err(anyhow::Error::new(err).context("websocket close failed")),
        }
    }
}
