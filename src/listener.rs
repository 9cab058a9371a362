//! Transport listener
//!
//! One TCP (or TLS) port serves both faces of the mailbox: the WebSocket
//! upgrade at `/{group}/connect` and the HTTP sideband (`clients`, `send`,
//! `receive`). The request head is read and parsed here so both can share
//! the socket; upgrades are completed manually, which also lets rejections
//! carry the exact status lines peers match on.

use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::config::{ServerConfig, TlsOptions};
use crate::error::ServerError;
use crate::registry::GroupRegistry;
use crate::router::Router;
use crate::session::{Outbound, PeerSession};
use crate::spill::SpillStore;
use crate::{MAX_SIDEBAND_BODY_BYTES, MIN_PEER_ID_LEN, SUPPORTED_MAJOR_VERSION};

/// Upper bound on an HTTP request head
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Shared state handed to every connection task
pub(crate) struct ListenerState {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<GroupRegistry>,
    pub(crate) store: Arc<SpillStore>,
    pub(crate) router: Router,
}

/// Accept loop; runs until `shutdown` fires
pub(crate) async fn run(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    state: Arc<ListenerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("Listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    }
                };
                let state = state.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => handle_connection(stream, addr, state).await,
                            Err(e) => debug!("TLS handshake failed for {}: {}", addr, e),
                        },
                        None => handle_connection(stream, addr, state).await,
                    }
                });
            }
        }
    }
}

/// Build a TLS acceptor from the configured certificate material
pub(crate) fn build_tls_acceptor(options: &TlsOptions) -> Result<TlsAcceptor, ServerError> {
    use tokio_rustls::rustls;

    if options.pfx_path.is_some() {
        return Err(ServerError::Tls(
            "PKCS#12 archives are not supported; provide a PEM certificate and key".into(),
        ));
    }
    let cert_path = options
        .cert_path
        .as_ref()
        .ok_or_else(|| ServerError::Tls("missing certificate path".into()))?;
    let key_path = options
        .key_path
        .as_ref()
        .ok_or_else(|| ServerError::Tls("missing private key path".into()))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("unreadable certificate: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(std::fs::File::open(key_path)?))
        .map_err(|e| ServerError::Tls(format!("unreadable private key: {}", e)))?
        .ok_or_else(|| ServerError::Tls("no private key found".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Serve one accepted connection
pub(crate) async fn handle_connection<S>(mut stream: S, addr: SocketAddr, state: Arc<ListenerState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (head_bytes, rest) = match read_request_head(&mut stream).await {
        Ok(parts) => parts,
        Err(e) => {
            debug!("Dropping connection from {}: {}", addr, e);
            return;
        }
    };
    let head = match RequestHead::parse(&head_bytes) {
        Some(head) => head,
        None => {
            let _ = write_response(&mut stream, "400 Bad Request", "text/plain", b"").await;
            return;
        }
    };

    let mut segments = head.path.trim_start_matches('/').splitn(2, '/');
    let group = segments.next().unwrap_or("").to_string();
    let action = segments.next().unwrap_or("").to_string();
    if group.is_empty() || action.is_empty() {
        let _ = write_response(&mut stream, "404 Not Found", "text/plain", b"").await;
        return;
    }

    if action == "connect" {
        handle_upgrade(stream, addr, &head, group, state).await;
    } else {
        handle_sideband(stream, &head, rest, &group, &action, state).await;
    }
}

/// Check upgrade parameters. Returns the peer id, or the status line to
/// reject with.
fn validate_handshake(head: &RequestHead, token: Option<&str>) -> Result<String, String> {
    let version = head.query("v").unwrap_or("");
    let major = semver::Version::parse(version).map(|v| v.major).ok();
    if major != Some(SUPPORTED_MAJOR_VERSION) {
        return Err(format!("409 Unsupported client IPC version \"{}\"", version));
    }

    let id = head.query("id").unwrap_or("");
    if id.len() < MIN_PEER_ID_LEN {
        return Err(format!("500 Invalid IPC client id \"{}\"", id));
    }

    if let Some(token) = token {
        if head.query("t") != Some(token) {
            return Err("403 Unauthorized".to_string());
        }
    }

    Ok(id.to_string())
}

/// Complete the WebSocket upgrade and run the peer session to its end
async fn handle_upgrade<S>(mut stream: S, addr: SocketAddr, head: &RequestHead, group: String, state: Arc<ListenerState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if !head.is_upgrade() {
        let _ = write_response(&mut stream, "400 Bad Request", "text/plain", b"").await;
        return;
    }

    let id = match validate_handshake(head, state.config.token.as_deref()) {
        Ok(id) => id,
        Err(status) => {
            debug!("Rejecting upgrade from {}: {}", addr, status);
            let _ = write_status(&mut stream, &status).await;
            return;
        }
    };

    let key = match head.header("sec-websocket-key") {
        Some(key) => key.to_string(),
        None => {
            let _ = write_response(&mut stream, "400 Bad Request", "text/plain", b"").await;
            return;
        }
    };
    let accept = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    );
    if stream.write_all(accept.as_bytes()).await.is_err() {
        return;
    }

    // Inbound frames above the payload budget drop the connection
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(state.config.max_payload);
    ws_config.max_frame_size = Some(state.config.max_payload);

    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, Some(ws_config)).await;
    let (mut ws_sink, mut ws_source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let session = Arc::new(PeerSession::new(id, group, tx));
    debug!(
        "Peer {} connected to group {} from {}",
        session.id(),
        session.group(),
        addr
    );

    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(text) => {
                    let len = text.len();
                    let result = ws_sink.send(Message::Text(text.into())).await;
                    writer_session.drained(len);
                    if result.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    state.router.admit(&session);

    while let Some(message) = ws_source.next().await {
        match message {
            Ok(Message::Text(text)) => state.router.handle_incoming(&session, &text),
            // Binary frames are silently dropped
            Ok(Message::Binary(_)) => continue,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Peer {} transport error: {}", session.id(), e);
                break;
            }
        }
    }

    state.router.handle_close(&session);
    session.close();
    let _ = writer.await;
    debug!("Peer {} disconnected", session.id());
}

/// Entry in the `/{group}/clients` listing
#[derive(Serialize)]
struct ClientEntry {
    id: String,
    connected: u64,
}

/// Serve one HTTP sideband request, then close the connection
async fn handle_sideband<S>(
    mut stream: S,
    head: &RequestHead,
    rest: Vec<u8>,
    group: &str,
    action: &str,
    state: Arc<ListenerState>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = match action {
        // Operator introspection, intentionally unauthenticated
        "clients" if head.method == "GET" => {
            let clients: Vec<ClientEntry> = state
                .registry
                .list(group)
                .iter()
                .map(|peer| ClientEntry {
                    id: peer.id().to_string(),
                    connected: peer.connected_at(),
                })
                .collect();
            let body = serde_json::to_vec(&clients).unwrap_or_else(|_| b"[]".to_vec());
            write_response(&mut stream, "200 OK", "application/json", &body).await
        }

        "send" => handle_send(&mut stream, head, rest, group, &state).await,

        "receive" if head.method == "GET" => {
            if sideband_peer(head, group, &state).is_none() {
                write_response(&mut stream, "401 Unauthorized", "text/plain", b"").await
            } else {
                let slot_id = head.query("msg").unwrap_or("");
                match state.store.take(slot_id) {
                    Some(payload) => {
                        write_response(&mut stream, "200 OK", "text/plain", payload.as_bytes()).await
                    }
                    None => write_response(&mut stream, "404 Not Found", "text/plain", b"").await,
                }
            }
        }

        _ => write_response(&mut stream, "404 Not Found", "text/plain", b"").await,
    };

    if let Err(e) = result {
        debug!("Sideband response failed: {}", e);
    }
}

/// `POST /{group}/send` (and its development-mode GET variant): inject a
/// frame from the identified peer as if it had arrived on its transport
async fn handle_send<S>(
    stream: &mut S,
    head: &RequestHead,
    rest: Vec<u8>,
    group: &str,
    state: &Arc<ListenerState>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let sender = match sideband_peer(head, group, state) {
        Some(sender) => sender,
        None => return write_response(stream, "401 Unauthorized", "text/plain", b"").await,
    };

    let frame = match head.method.as_str() {
        "POST" => {
            let length = match head
                .header("content-length")
                .and_then(|v| v.trim().parse::<usize>().ok())
            {
                Some(length) => length,
                None => return write_response(stream, "411 Length Required", "text/plain", b"").await,
            };
            if length > MAX_SIDEBAND_BODY_BYTES {
                return write_response(stream, "413 Payload Too Large", "text/plain", b"").await;
            }
            match read_body(stream, rest, length).await {
                Ok(body) => String::from_utf8_lossy(&body).into_owned(),
                Err(e) => {
                    debug!("Incomplete send body from peer {}: {}", sender.id(), e);
                    return Ok(());
                }
            }
        }
        "GET" => {
            if !state.config.dev_mode {
                return write_response(stream, "405 Method Not Allowed", "text/plain", b"").await;
            }
            match head.query("msg") {
                Some(msg) => msg.to_string(),
                None => return write_response(stream, "400 Bad Request", "text/plain", b"").await,
            }
        }
        _ => return write_response(stream, "405 Method Not Allowed", "text/plain", b"").await,
    };

    state.router.handle_incoming(&sender, &frame);
    write_response(stream, "200 OK", "text/plain", b"ok").await
}

/// Sideband requests must carry the token (when configured) and the id of
/// a connected peer
fn sideband_peer(
    head: &RequestHead,
    group: &str,
    state: &Arc<ListenerState>,
) -> Option<Arc<PeerSession>> {
    if let Some(token) = state.config.token.as_deref() {
        if head.query("t") != Some(token) {
            return None;
        }
    }
    state
        .registry
        .find_by_id(group, head.query("id").unwrap_or(""))
}

/// Read up to the blank line ending the request head. Returns the head and
/// whatever was read past it (the start of a request body).
async fn read_request_head<S>(stream: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_head_end(&buffer) {
            let rest = buffer.split_off(end);
            return Ok((buffer, rest));
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

async fn read_body<S>(stream: &mut S, rest: Vec<u8>, length: usize) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = rest;
    body.truncate(length);
    while body.len() < length {
        let mut chunk = vec![0u8; (length - body.len()).min(64 * 1024)];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(length);
    Ok(body)
}

async fn write_status<S>(stream: &mut S, status: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!("HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n", status);
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await
}

async fn write_response<S>(
    stream: &mut S,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {}\r\nConnection: close\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// A parsed HTTP request head
pub(crate) struct RequestHead {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a request head. Query strings are split permissively on `&`
    /// and `=` with no percent-decoding; ids, tokens and slot ids are
    /// URL-safe by construction.
    pub(crate) fn parse(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let mut lines = text.split("\r\n");

        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?;

        let (path, query_string) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        let query = query_string
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        Some(Self {
            method,
            path: path.to_string(),
            query,
            headers,
        })
    }

    pub(crate) fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn is_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}
