//! WebSocket telemetry client used by workers and observers.
//!
//! Provides:
//! - Connection lifecycle with automatic re-join of known rooms
//! - Domain event sending with an offline queue
//! - Checkpoint upload split into chunks, and checkpoint deletion
//! - Replayed and live room events delivered as [`ClientEvent`]s
//!
//! Reference: Kleppmann, Chapter 11: Stream Processing

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use mlboard_core::{CheckpointEntityKey, ChunkMessage, Event, EventType};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum bytes per checkpoint chunk
    pub chunk_size: usize,
    /// Events kept while disconnected
    pub offline_queue_capacity: usize,
    /// Capacity of the outgoing and event channels
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            offline_queue_capacity: 10_000,
            channel_capacity: 256,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the telemetry client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A room event, replayed or live
    Event {
        room_id: String,
        event_id: u64,
        data: Event,
    },
    /// Reply to a ping
    Pong,
    /// The server could not open a room we asked for
    JoinFailed { room_id: String, reason: String },
    /// Informational message from the server
    ServerLog(String),
}

impl From<ServerMessage> for ClientEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Event { room_id, event_id, data } => Self::Event {
                room_id,
                event_id,
                data,
            },
            ServerMessage::Pong => Self::Pong,
            ServerMessage::JoinFailed { room_id, reason } => Self::JoinFailed { room_id, reason },
            ServerMessage::ServerLog(text) => Self::ServerLog(text),
        }
    }
}

/// Offline queue for events emitted while disconnected.
///
/// Queued events are sent on reconnection, oldest first.
pub struct OfflineQueue {
    queue: VecDeque<Event>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an event for later sending.
    pub fn enqueue(&mut self, event: Event) -> bool {
        if self.queue.len() >= self.max_size {
            return false; // Queue full
        }
        self.queue.push_back(event);
        true
    }

    /// Drain all queued events.
    pub fn drain(&mut self) -> Vec<Event> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Split `bytes` into checkpoint chunks of at most `chunk_size` bytes.
///
/// An empty artifact is sent as one empty chunk so it still completes.
pub fn split_into_chunks(key: &CheckpointEntityKey, bytes: &[u8], chunk_size: usize) -> Vec<ChunkMessage> {
    let parts: Vec<&[u8]> = if bytes.is_empty() {
        vec![bytes]
    } else {
        bytes.chunks(chunk_size.max(1)).collect()
    };
    let total = parts.len() as u32;
    parts
        .into_iter()
        .enumerate()
        .map(|(id, part)| ChunkMessage::chunk(key.clone(), id as u32, part.to_vec(), total))
        .collect()
}

/// The telemetry client.
pub struct TelemetryClient {
    /// Name announced on join
    client_id: Option<String>,

    server_url: String,

    config: ClientConfig,

    state: Arc<RwLock<ConnectionState>>,

    /// Rooms to (re-)join on every connect
    rooms: Arc<Mutex<BTreeSet<String>>>,

    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,
}

impl TelemetryClient {
    pub fn new(server_url: impl Into<String>, client_id: Option<String>) -> Self {
        Self::with_config(server_url, client_id, ClientConfig::default())
    }

    pub fn with_config(server_url: impl Into<String>, client_id: Option<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            client_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            rooms: Arc::new(Mutex::new(BTreeSet::new())),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(config.offline_queue_capacity))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            config,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns reader and writer tasks, re-joins known rooms and flushes the
    /// offline queue.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.channel_capacity.max(1));
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        let rooms: Vec<String> = self.rooms.lock().await.iter().cloned().collect();
        if !rooms.is_empty() {
            self.send(&ClientMessage::join(self.client_id.clone(), rooms)).await?;
        }

        // Replay offline queue
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Sending {} queued events", queued.len());
            for event in queued {
                self.send(&ClientMessage::Event(event)).await?;
            }
        }

        // Reader task: turn server frames into client events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if event_tx.send(ClientEvent::from(server_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Join rooms. Remembered across reconnects; sent now if connected.
    pub async fn join(&self, rooms: Vec<String>) -> Result<(), ProtocolError> {
        self.rooms.lock().await.extend(rooms.iter().cloned());
        if self.connection_state().await == ConnectionState::Connected {
            self.send(&ClientMessage::join(self.client_id.clone(), rooms)).await?;
        }
        Ok(())
    }

    /// Leave all rooms; the server ends the session.
    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.rooms.lock().await.clear();
        self.send(&ClientMessage::Leave).await
    }

    /// Send a telemetry event addressed by `payload.grid_search_id`.
    ///
    /// If disconnected, queues the event for later sending.
    pub async fn send_event(&self, event_type: EventType, payload: Value) -> Result<(), ProtocolError> {
        let event = Event::new(event_type, payload);
        if self.connection_state().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(event) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send(&ClientMessage::Event(event)).await
    }

    /// Upload an artifact as chunks. Returns the number of chunks sent.
    pub async fn send_checkpoint(&self, key: &CheckpointEntityKey, bytes: &[u8]) -> Result<u32, ProtocolError> {
        let chunks = split_into_chunks(key, bytes, self.config.chunk_size);
        let total = chunks.len() as u32;
        for chunk in chunks {
            self.send(&ClientMessage::Checkpoint(chunk)).await?;
        }
        log::debug!("Sent checkpoint {key} as {total} chunks");
        Ok(total)
    }

    /// Ask the server to drop the artifact of `key`.
    pub async fn delete_checkpoint(&self, key: &CheckpointEntityKey) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Checkpoint(ChunkMessage::delete(key.clone()))).await
    }

    /// Send a ping to the server.
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let encoded = msg.encode()?;
        tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Rooms joined (or to be joined on connect).
    pub async fn rooms(&self) -> Vec<String> {
        self.rooms.lock().await.iter().cloned().collect()
    }

    /// Get offline queue length.
    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
