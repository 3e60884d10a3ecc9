//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Worker A ──┐                                   ┌── Room "gs1" ── EventLog ── EventStorage
//!            ├── Session ── Broker ──────────────┤        └─ BroadcastGroup ──► Observers
//! Worker B ──┘                │                  └── Room "gs2" ...
//!                             └── EntityCache ── CheckpointStore (filesystem)
//! ```
//!
//! Each connection has a reader task that feeds the session and a writer
//! task that selects over the session's outbound queue, socket control
//! frames and a heartbeat timer. A background task periodically retries
//! checkpoints whose persistence failed.
//!
//! Reference: Kleppmann: Designing Data-Intensive Applications, Chapters 3 & 11

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broker::{Broker, BrokerError, Flow};
use crate::entity_cache::EntityCache;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::rooms::RoomDirectory;
use crate::storage::{EventStorage, FsCheckpointStore, MemoryEventStorage, RocksEventStorage, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pending socket-level frames (pongs, close) per connection.
const CONTROL_CAPACITY: usize = 16;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
    /// Events read per replay batch
    pub replay_batch_size: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Interval between retries of failed checkpoint persists
    pub persist_retry_interval_secs: u64,
    /// Event storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Root directory of persisted checkpoints
    pub checkpoint_dir: PathBuf,
    /// File extension of persisted checkpoints
    pub checkpoint_extension: String,
    /// RocksDB tuning; `path` is taken from `storage_path`
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5002".to_string(),
            broadcast_capacity: 256,
            outbound_capacity: 1024,
            replay_batch_size: 256,
            heartbeat_interval_secs: 30,
            persist_retry_interval_secs: 10,
            storage_path: None,
            checkpoint_dir: PathBuf::from("mlboard_data/checkpoints"),
            checkpoint_extension: "pickle".to_string(),
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Config for tests: ephemeral port, in-memory events, checkpoints under `dir`.
    pub fn for_testing(dir: impl AsRef<Path>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            outbound_capacity: 256,
            replay_batch_size: 16,
            heartbeat_interval_secs: 30,
            persist_retry_interval_secs: 1,
            storage_path: None,
            checkpoint_dir: dir.as_ref().join("checkpoints"),
            checkpoint_extension: "pickle".to_string(),
            store: StoreConfig::for_testing(dir.as_ref().join("events")),
        }
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(ConfigError::Parse)
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "Cannot read config {}: {source}", path.display()),
            Self::Parse(e) => write!(f, "Invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub active_rooms: usize,
    pub events_published: u64,
    pub checkpoints_persisted: u64,
    pub pending_checkpoints: usize,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    broker: Arc<Broker>,
    /// Connection-level counters
    stats: Arc<RwLock<ServerStats>>,
    /// Persistent event store (optional)
    store: Option<Arc<RocksEventStorage>>,
}

impl RelayServer {
    /// Create a relay server, opening event storage as configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..config.store.clone()
                };
                Some(Arc::new(RocksEventStorage::open(store_config)?))
            }
            None => None,
        };
        let storage: Arc<dyn EventStorage> = match &store {
            Some(store) => store.clone(),
            None => Arc::new(MemoryEventStorage::new()),
        };

        let directory = Arc::new(RoomDirectory::new(
            storage,
            config.broadcast_capacity,
            config.replay_batch_size,
        ));
        let checkpoints = Arc::new(FsCheckpointStore::new(
            &config.checkpoint_dir,
            config.checkpoint_extension.clone(),
        ));
        let cache = Arc::new(EntityCache::new(checkpoints));
        let broker = Arc::new(Broker::new(directory, cache, config.outbound_capacity));

        Ok(Self {
            config,
            broker,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
        })
    }

    /// Open every persisted room so numbering continues where it stopped.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let recovered = self.broker.directory().recover().await?;
        log::info!("Recovery complete: {recovered} rooms restored");
        Ok(recovered)
    }

    /// Recover, bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.recover().await?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);

        let retry = self.spawn_persist_retry();
        let result = self.accept_loop(listener).await;
        retry.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let broker = self.broker.clone();
            let stats = self.stats.clone();
            let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, broker, stats, heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_persist_retry(&self) -> tokio::task::JoinHandle<()> {
        let cache = self.broker.cache().clone();
        let period = Duration::from_secs(self.config.persist_retry_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let persisted = cache.retry_pending().await;
                if persisted > 0 {
                    log::info!("Persisted {persisted} previously failed checkpoints");
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    ///
    /// The reader side runs here; a separate writer task owns the socket
    /// sink, so a full outbound queue never blocks inbound handling.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        broker: Arc<Broker>,
        stats: Arc<RwLock<ServerStats>>,
        heartbeat: Duration,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut session, outbound_rx) = broker.open_session();
        let (control_tx, control_rx) = mpsc::channel::<Message>(CONTROL_CAPACITY);
        let mut writer = tokio::spawn(Self::write_loop(ws_sender, outbound_rx, control_rx, heartbeat));
        let mut writer_result = None;

        let result = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }

                                let client_msg = match ClientMessage::decode(&data) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Undecodable frame from {addr}, closing: {e}");
                                        break;
                                    }
                                };

                                match session.handle(client_msg).await {
                                    Ok(Flow::Continue) => {}
                                    Ok(Flow::Close) => {
                                        // Writer flushes what the session queued, then closes
                                        let _ = control_tx.send(Message::Close(None)).await;
                                        break;
                                    }
                                    Err(BrokerError::SessionClosed) => break,
                                    Err(e) => {
                                        stats.write().await.rejected_messages += 1;
                                        log::warn!("Message from {addr} rejected: {e}");
                                    }
                                }
                            }

                            Some(Ok(Message::Text(_))) => {
                                log::warn!("{} from {addr}, closing", ProtocolError::UnexpectedFrame);
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                if control_tx.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Writer stopped: socket failed or the session queue closed
                    joined = &mut writer, if writer_result.is_none() => {
                        writer_result = Some(joined);
                        break;
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup: memberships go, rooms stay
        session.close().await;
        drop(control_tx);
        let written = match writer_result {
            Some(joined) => joined,
            None => writer.await,
        };
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result.and(written.map_err(BoxError::from).and_then(|r| r))
    }

    /// Drain the session's outbound queue and control frames into the socket.
    async fn write_loop(
        mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut outbound_rx: mpsc::Receiver<ServerMessage>,
        mut control_rx: mpsc::Receiver<Message>,
        heartbeat: Duration,
    ) -> Result<(), BoxError> {
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        loop {
            tokio::select! {
                biased;

                control = control_rx.recv() => {
                    match control {
                        Some(Message::Close(frame)) => {
                            while let Ok(out) = outbound_rx.try_recv() {
                                ws_sender.send(Message::Binary(out.encode()?.into())).await?;
                            }
                            ws_sender.send(Message::Close(frame)).await?;
                            break;
                        }
                        Some(frame) => ws_sender.send(frame).await?,
                        // Reader finished
                        None => break,
                    }
                }

                // Outgoing replay / live events and replies
                out = outbound_rx.recv() => {
                    match out {
                        Some(msg) => {
                            let encoded = msg.encode()?;
                            ws_sender.send(Message::Binary(encoded.into())).await?;
                        }
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let broker_stats = self.broker.stats();
        stats.active_rooms = self.broker.directory().room_count().await;
        stats.events_published = broker_stats.events_published;
        stats.checkpoints_persisted = broker_stats.checkpoints_persisted;
        stats.pending_checkpoints = self.broker.cache().len().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Get the persistent event store (if configured).
    pub fn store(&self) -> Option<&Arc<RocksEventStorage>> {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:5002");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.storage_path.is_none());
        assert_eq!(config.checkpoint_extension, "pickle");
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = ServerConfig::from_json_str(
            r#"{"bind_addr": "0.0.0.0:7000", "storage_path": "/var/lib/mlboard", "store": {"sync_writes": true}}"#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/mlboard")));
        assert!(config.store.sync_writes);
        assert_eq!(config.store.bloom_filter_bits, 10);
        assert_eq!(config.replay_batch_size, 256);
    }

    #[test]
    fn test_config_errors() {
        assert!(matches!(ServerConfig::from_json_str("{not json"), Err(ConfigError::Parse(_))));
        let err = ServerConfig::from_json_file("/nonexistent/mlboard.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("mlboard.json"));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, r#"{"heartbeat_interval_secs": 5}"#).unwrap();
        let config = ServerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.heartbeat_interval_secs, 5);
    }

    #[tokio::test]
    async fn test_server_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::new(ServerConfig::for_testing(dir.path())).unwrap();
        assert!(server.store().is_none());
        assert_eq!(server.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing(dir.path())
        };
        let server = RelayServer::new(config).unwrap();
        assert!(server.store().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::new(ServerConfig::for_testing(dir.path())).unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.pending_checkpoints, 0);
    }
}
