//! Peer-to-peer transport for ForkLedger
//!
//! Plain TCP carrying length-prefixed frames: a big-endian `u32` byte count
//! followed by one encoded [`WireMessage`]. Outgoing gossip goes through one
//! queue per destination so frames to the same peer keep their order. Sync
//! requests use a short-lived blocking connection with timeouts.

use crate::blockchain::{Block, ChainStatus};
use crate::codec::{MessageCodec, WireMessage};
use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use crate::participant::Participant;
use crate::sync::BlockSource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Upper bound for a single frame; larger length prefixes are treated as garbage.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Frames buffered per destination before new ones are dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Reads one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

fn read_frame_blocking(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

fn write_frame_blocking(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

fn resolve(address: &str, port: u16) -> io::Result<SocketAddr> {
    (address, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}:{}", address, port)))
}

/// Processes inbound messages. Runs on the blocking pool, so it may wait on
/// locks or on other peers. A returned message is written back on the same
/// connection.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: WireMessage) -> Option<WireMessage>;
}

/// Accepts connections until the listener fails.
pub async fn serve(listener: TcpListener, handler: Arc<dyn MessageHandler>) -> Result<(), ChainError> {
    let local = listener.local_addr()?;
    tracing::info!("Listening for peers on {}", local);
    loop {
        let (stream, remote) = listener.accept().await?;
        tracing::debug!("Accepted connection from {}", remote);
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handler).await {
                tracing::debug!("Connection from {} closed: {}", remote, e);
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, handler: Arc<dyn MessageHandler>) -> Result<(), ChainError> {
    while let Some(frame) = read_frame(&mut stream).await? {
        let message = match WireMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping undecodable frame: {}", e);
                continue;
            }
        };

        let handler = handler.clone();
        let reply = tokio::task::spawn_blocking(move || handler.handle(message))
            .await
            .map_err(|e| ChainError::NetworkError(format!("Message handler failed: {}", e)))?;

        if let Some(reply) = reply {
            write_frame(&mut stream, &reply.encode()?).await?;
        }
    }
    Ok(())
}

/// Fire-and-forget delivery with one ordered queue per destination.
///
/// Safe to call from threads outside the runtime; queue workers are spawned
/// on the runtime handle given at construction. Each queue is bounded, so an
/// unreachable peer costs at most `queue_capacity` buffered frames.
pub struct Outbound {
    runtime: Handle,
    queues: Mutex<HashMap<(String, u16), mpsc::Sender<Vec<u8>>>>,
    connect_timeout: Duration,
    queue_capacity: usize,
}

impl Outbound {
    pub fn new(runtime: Handle, connect_timeout: Duration) -> Self {
        Self {
            runtime,
            queues: Mutex::new(HashMap::new()),
            connect_timeout,
            queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Queues `payload` for the destination. Returns `false` if the frame was
    /// dropped because the destination's queue is full.
    pub fn send_async(&self, address: &str, port: u16, payload: Vec<u8>) -> bool {
        let mut queues = self.queues.lock();
        let key = (address.to_string(), port);
        let payload = match queues.get(&key) {
            Some(queue) => match queue.try_send(payload) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Outbound queue for {}:{} is full, dropping frame", address, port);
                    return false;
                }
                // Worker gone; a fresh queue replaces it.
                Err(mpsc::error::TrySendError::Closed(payload)) => payload,
            },
            None => payload,
        };
        self.spawn_queue(&mut queues, key, payload);
        true
    }

    pub fn send_to(&self, peer: &Participant, payload: Vec<u8>) -> bool {
        self.send_async(&peer.address, peer.port, payload)
    }

    fn spawn_queue(
        &self,
        queues: &mut HashMap<(String, u16), mpsc::Sender<Vec<u8>>>,
        key: (String, u16),
        first: Vec<u8>,
    ) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        // Fresh queue with room for at least one frame, so this cannot fail.
        let _ = sender.try_send(first);
        let (address, port) = key.clone();
        self.runtime
            .spawn(deliver_queue(address, port, receiver, self.connect_timeout));
        queues.insert(key, sender);
    }
}

async fn deliver_queue(
    address: String,
    port: u16,
    mut receiver: mpsc::Receiver<Vec<u8>>,
    connect_timeout: Duration,
) {
    let mut connection: Option<TcpStream> = None;
    while let Some(payload) = receiver.recv().await {
        if connection.is_none() {
            let target = format!("{}:{}", address, port);
            match tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await {
                Ok(Ok(stream)) => connection = Some(stream),
                Ok(Err(e)) => {
                    tracing::warn!("Cannot reach {}: {}", target, e);
                    continue;
                }
                Err(_) => {
                    tracing::warn!("Connecting to {} timed out", target);
                    continue;
                }
            }
        }

        if let Some(stream) = connection.as_mut() {
            if let Err(e) = write_frame(stream, &payload).await {
                tracing::warn!("Sending to {}:{} failed: {}", address, port, e);
                connection = None;
            }
        }
    }
}

/// Blocking request/response client used for chain synchronisation.
#[derive(Debug, Clone)]
pub struct SyncClient {
    codec: MessageCodec,
    node_name: String,
    socket_timeout: Duration,
    request_timeout: Duration,
}

impl SyncClient {
    pub fn new(codec: MessageCodec, node_name: impl Into<String>, socket_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            codec,
            node_name: node_name.into(),
            socket_timeout,
            request_timeout,
        }
    }

    fn request(&self, peer: &Participant, message: &WireMessage, timeout: Duration) -> Result<WireMessage, ChainError> {
        let addr = resolve(&peer.address, peer.port)?;
        let mut stream = StdTcpStream::connect_timeout(&addr, self.socket_timeout)?;
        stream.set_write_timeout(Some(self.socket_timeout))?;
        stream.set_read_timeout(Some(timeout))?;

        write_frame_blocking(&mut stream, &message.encode()?)?;
        // A peer that refuses the request closes the connection instead of answering.
        stream.shutdown(Shutdown::Write)?;
        let reply = read_frame_blocking(&mut stream)?;
        WireMessage::decode(&reply)
    }

    pub fn request_status(&self, peer: &Participant) -> Option<ChainStatus> {
        match self.request(peer, &WireMessage::StatusRequest, self.socket_timeout) {
            Ok(WireMessage::StatusResponse(status)) => Some(status),
            Ok(other) => {
                tracing::warn!("{} answered a status request with a {}", peer.name, other.kind());
                None
            }
            Err(e) => {
                tracing::warn!("Status request to {} failed: {}", peer.name, e);
                None
            }
        }
    }
}

impl BlockSource for SyncClient {
    fn request_blocks(&self, peer: &Participant, from: u64, to: Option<u64>, from_hash: Sha256Hash) -> Option<Vec<Block>> {
        let request = WireMessage::SyncRequest {
            from,
            to,
            from_hash: Some(from_hash),
            sending_node: self.node_name.clone(),
        };
        match self.request(peer, &request, self.request_timeout) {
            Ok(WireMessage::SyncResponse(blocks)) => self.codec.verify_blocks(blocks),
            Ok(other) => {
                tracing::warn!("{} answered a sync request with a {}", peer.name, other.kind());
                None
            }
            Err(e) => {
                tracing::warn!("Sync request to {} failed: {}", peer.name, e);
                None
            }
        }
    }
}
