//! Mailbox server lifecycle
//!
//! Wires the registry, spill store, router and transport listener
//! together. `start` resolves once the socket is bound; `stop` halts the
//! listener and closes every active session, which plays out as normal
//! disconnects to any peer still listening.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::listener::{self, ListenerState};
use crate::registry::GroupRegistry;
use crate::router::Router;
use crate::spill::SpillStore;

/// Seconds between spill-store expiry sweeps
const SWEEP_INTERVAL_SECS: u64 = 1;

/// The IPC mailbox server
pub struct MailboxServer {
    config: ServerConfig,
    registry: Arc<GroupRegistry>,
    store: Arc<SpillStore>,
    router: Router,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MailboxServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(GroupRegistry::new());
        let store = Arc::new(SpillStore::new());
        let router = Router::new(registry.clone(), store.clone(), config.max_payload);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            store,
            router,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the listener and begin serving. Resolves once the socket is
    /// bound; a bind or TLS failure is returned as a descriptive error.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let tls = match &self.config.ssl {
            Some(options) => Some(listener::build_tls_acceptor(options)?),
            None => None,
        };

        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let socket = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = socket.local_addr()?;

        let state = Arc::new(ListenerState {
            config: self.config.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            router: self.router.clone(),
        });

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(listener::run(
            socket,
            tls,
            state,
            self.shutdown.subscribe(),
        )));

        let store = self.store.clone();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => store.sweep(),
                }
            }
        }));

        info!(
            "IPC mailbox listening on {} (TLS {})",
            local_addr,
            if self.config.ssl.is_some() { "on" } else { "off" }
        );
        Ok(local_addr)
    }

    /// Stop accepting connections and close every active session
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        for session in self.registry.all() {
            session.close();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("IPC mailbox stopped");
    }

    /// Number of known groups (for monitoring)
    pub fn group_count(&self) -> usize {
        self.registry.group_count()
    }

    /// Number of connected peers (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(config: ServerConfig) -> (MailboxServer, SocketAddr) {
        let server = MailboxServer::new(config);
        let addr = server.start().await.expect("server should start");
        (server, addr)
    }

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::new(0);
        config.host = "127.0.0.1".into();
        config.max_payload = 50;
        config.token = Some("s".into());
        config
    }

    async fn connect(addr: SocketAddr, id: &str) -> Client {
        let url = format!("ws://{}/mydb/connect?id={}&v=1.0.0&t=s", addr, id);
        let (client, _) = connect_async(url).await.expect("upgrade should succeed");
        client
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            match client.next().await.expect("stream ended").expect("frame") {
                Message::Text(text) => return text.to_string(),
                _ => continue,
            }
        }
    }

    async fn http(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }

    async fn wait_for_peer_count(server: &MailboxServer, expected: usize) {
        for _ in 0..100 {
            if server.peer_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.peer_count(), expected);
    }

    #[tokio::test]
    async fn test_handshake_welcome() {
        let (server, addr) = start(test_config()).await;
        let mut client1 = connect(addr, "client1").await;

        assert_eq!(next_text(&mut client1).await, r#"welcome:{"maxPayload":50}"#);
        wait_for_peer_count(&server, 1).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_rejects_version() {
        let (server, addr) = start(test_config()).await;
        let url = format!("ws://{}/mydb/connect?id=client1&v=2.0.0&t=s", addr);

        match connect_async(url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 409),
            other => panic!("expected an HTTP rejection, got {:?}", other.map(|_| ())),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_rejects_token() {
        let (server, addr) = start(test_config()).await;
        let url = format!("ws://{}/mydb/connect?id=client1&v=1.0.0&t=wrong", addr);

        match connect_async(url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
            other => panic!("expected an HTTP rejection, got {:?}", other.map(|_| ())),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_direct_and_broadcast() {
        let (server, addr) = start(test_config()).await;
        let mut client1 = connect(addr, "client1").await;
        next_text(&mut client1).await;
        let mut client2 = connect(addr, "client2").await;
        next_text(&mut client2).await;
        assert_eq!(next_text(&mut client1).await, "connect:client2");

        client1
            .send(Message::Text("to:client2;hello".into()))
            .await
            .expect("send");
        assert_eq!(next_text(&mut client2).await, "msg:hello");

        client1
            .send(Message::Text("announce".into()))
            .await
            .expect("send");
        assert_eq!(next_text(&mut client2).await, "announce");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (server, addr) = start(test_config()).await;
        let mut client1 = connect(addr, "client1").await;
        next_text(&mut client1).await;

        client1.send(Message::Text("ping".into())).await.expect("send");
        assert_eq!(next_text(&mut client1).await, "pong");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_clients_listing() {
        let (server, addr) = start(test_config()).await;
        let mut client1 = connect(addr, "client1").await;
        next_text(&mut client1).await;

        let response = http(addr, "GET /mydb/clients HTTP/1.1\r\nHost: t\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains(r#""id":"client1""#));
        assert!(response.contains(r#""connected":"#));

        let response = http(addr, "GET /nosuchdb/clients HTTP/1.1\r\nHost: t\r\n\r\n").await;
        assert!(response.ends_with("[]"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_sideband_spill_round_trip() {
        let (server, addr) = start(test_config()).await;
        let mut client1 = connect(addr, "client1").await;
        next_text(&mut client1).await;
        let mut client2 = connect(addr, "client2").await;
        next_text(&mut client2).await;
        next_text(&mut client1).await; // connect:client2

        // An oversized frame has to come in over the sideband
        let body = format!("to:client2;{}", "x".repeat(200));
        let request = format!(
            "POST /mydb/send?id=client1&t=s HTTP/1.1\r\nHost: t\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let response = http(addr, &request).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok"));

        let spilled = next_text(&mut client2).await;
        let slot_id = spilled
            .strip_prefix("msg:get:")
            .expect("expected a spilled reference");
        assert_eq!(slot_id.len(), 24);

        let request = format!("GET /mydb/receive?id=client2&msg={}&t=s HTTP/1.1\r\nHost: t\r\n\r\n", slot_id);
        let response = http(addr, &request).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with(&"x".repeat(200)));

        // Readable at most once
        let request = format!("GET /mydb/receive?id=client2&msg={}&t=s HTTP/1.1\r\nHost: t\r\n\r\n", slot_id);
        let response = http(addr, &request).await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_sideband_rejects_unknown_peer() {
        let (server, addr) = start(test_config()).await;

        let response = http(
            addr,
            "POST /mydb/send?id=ghost9&t=s HTTP/1.1\r\nHost: t\r\nContent-Length: 2\r\n\r\nhi",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 401 Unauthorized"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_sideband_get_send_requires_dev_mode() {
        let (server, addr) = start(test_config()).await;
        let mut client1 = connect(addr, "client1").await;
        next_text(&mut client1).await;

        let response = http(addr, "GET /mydb/send?id=client1&t=s&msg=hi HTTP/1.1\r\nHost: t\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed"));
        server.stop().await;

        let mut config = test_config();
        config.dev_mode = true;
        let (server, addr) = start(config).await;
        let mut client1 = connect(addr, "client1").await;
        next_text(&mut client1).await;
        let mut client2 = connect(addr, "client2").await;
        next_text(&mut client2).await;

        let response = http(
            addr,
            "GET /mydb/send?id=client1&t=s&msg=to:client2;hi HTTP/1.1\r\nHost: t\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(next_text(&mut client2).await, "msg:hi");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_id_eviction() {
        let (server, addr) = start(test_config()).await;
        let mut original = connect(addr, "client1").await;
        next_text(&mut original).await;
        let mut observer = connect(addr, "client2").await;
        next_text(&mut observer).await;
        next_text(&mut original).await; // connect:client2

        let mut replacement = connect(addr, "client1").await;
        assert_eq!(next_text(&mut replacement).await, r#"welcome:{"maxPayload":50}"#);

        assert_eq!(next_text(&mut observer).await, "disconnect:client1");
        assert_eq!(next_text(&mut observer).await, "connect:client1");
        assert_eq!(server.peer_count(), 2);

        // The original transport is closed by the server
        loop {
            match original.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => continue,
            }
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_cross_group_isolation() {
        let (server, addr) = start(test_config()).await;
        let mut client1 = connect(addr, "client1").await;
        next_text(&mut client1).await;

        let url = format!("ws://{}/otherdb/connect?id=stranger1&v=1.0.0&t=s", addr);
        let (mut stranger, _) = connect_async(url).await.expect("upgrade");
        next_text(&mut stranger).await;

        // A broadcast in mydb must not reach otherdb
        client1.send(Message::Text("announce".into())).await.expect("send");
        client1.send(Message::Text("ping".into())).await.expect("send");
        assert_eq!(next_text(&mut client1).await, "pong");

        let quiet = tokio::time::timeout(Duration::from_millis(200), stranger.next()).await;
        assert!(quiet.is_err(), "stranger should have received nothing");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_sessions() {
        let (server, addr) = start(test_config()).await;
        let mut client1 = connect(addr, "client1").await;
        next_text(&mut client1).await;

        server.stop().await;

        loop {
            match client1.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => continue,
            }
        }
        wait_for_peer_count(&server, 0).await;
    }
}
