//! Framed message channels over TCP and the dialer that opens them

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::handshake::HandshakeCodec;
use super::messages::MessageCodec;
use super::types::PeerMessage;
use crate::config::PeerConfig;
use crate::torrent::TorrentError;

/// Sending half of a peer message channel.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Queues `message` for the remote peer.
    ///
    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Channel closed locally or by the peer
    async fn send(&self, message: PeerMessage) -> Result<(), TorrentError>;

    /// Closes the channel. Safe to call repeatedly and from any thread.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Receiving half of a peer message channel.
///
/// `receive` must be cancel safe: dropping its future loses no bytes.
#[async_trait]
pub trait MessageReceiver: Send {
    /// Waits for the next complete message.
    ///
    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Peer went away
    /// - `TorrentError::ProtocolViolation` - Undecodable frame
    /// - `TorrentError::Io` - Socket failure
    async fn receive(&mut self) -> Result<PeerMessage, TorrentError>;
}

/// A connected, framed, bidirectional channel to one remote endpoint.
pub struct PeerTransport {
    pub remote_address: SocketAddr,
    pub sender: Arc<dyn MessageSender>,
    pub receiver: Box<dyn MessageReceiver>,
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTransport")
            .field("remote_address", &self.remote_address)
            .finish_non_exhaustive()
    }
}

/// TCP-backed transport.
///
/// The read half parses the handshake first and length-prefixed frames
/// afterwards. Writes go through a bounded queue drained by a writer task.
pub struct TcpTransport;

impl TcpTransport {
    /// Wraps an already-connected stream, reading into `read_buffer`.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Stream has no peer address
    pub fn from_stream(
        stream: TcpStream,
        read_buffer: BytesMut,
        config: &PeerConfig,
    ) -> Result<PeerTransport, TorrentError> {
        let remote_address = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (outbound, queue) = mpsc::channel(config.send_queue_len.max(1));
        let writer = tokio::spawn(run_writer(write_half, queue, remote_address));

        let sender = Arc::new(TcpMessageSender {
            remote_address,
            outbound,
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        });
        let receiver = Box::new(TcpMessageReceiver {
            remote_address,
            reader: read_half,
            buffer: read_buffer,
            handshake_pending: true,
            max_frame_len: config.max_frame_len,
        });

        Ok(PeerTransport {
            remote_address,
            sender,
            receiver,
        })
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<PeerMessage>,
    remote_address: SocketAddr,
) {
    let mut frame = BytesMut::new();
    while let Some(message) = queue.recv().await {
        frame.clear();
        MessageCodec::encode(&message, &mut frame);
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!("Write to {} failed: {}", remote_address, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

struct TcpMessageSender {
    remote_address: SocketAddr,
    outbound: mpsc::Sender<PeerMessage>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl MessageSender for TcpMessageSender {
    async fn send(&self, message: PeerMessage) -> Result<(), TorrentError> {
        if self.is_closed() {
            return Err(TorrentError::ConnectionClosed {
                address: self.remote_address,
            });
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TorrentError::ConnectionClosed {
                address: self.remote_address,
            })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbound.is_closed()
    }
}

impl Drop for TcpMessageSender {
    fn drop(&mut self) {
        self.close();
    }
}

struct TcpMessageReceiver {
    remote_address: SocketAddr,
    reader: OwnedReadHalf,
    buffer: BytesMut,
    handshake_pending: bool,
    max_frame_len: usize,
}

#[async_trait]
impl MessageReceiver for TcpMessageReceiver {
    async fn receive(&mut self) -> Result<PeerMessage, TorrentError> {
        loop {
            if self.handshake_pending {
                if let Some(handshake) = HandshakeCodec::decode(&mut self.buffer)? {
                    self.handshake_pending = false;
                    return Ok(PeerMessage::Handshake(handshake));
                }
            } else if let Some(message) =
                MessageCodec::decode_frame(&mut self.buffer, self.max_frame_len)?
            {
                return Ok(message);
            }

            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                return Err(TorrentError::ConnectionClosed {
                    address: self.remote_address,
                });
            }
        }
    }
}

/// A failed dial.
///
/// `buffer` comes back when the failure is transient, so the caller can
/// pool it for a later attempt against another address.
#[derive(Debug)]
pub struct DialError {
    pub error: TorrentError,
    pub buffer: Option<BytesMut>,
}

/// Opens outbound transports.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `address`, reading through `buffer` once connected.
    ///
    /// Implementations bound the connect themselves and treat running out of
    /// time as a transient failure.
    ///
    /// # Errors
    /// - `DialError` wrapping `TorrentError::ConnectFailure`
    async fn dial(
        &self,
        address: SocketAddr,
        buffer: BytesMut,
    ) -> Result<PeerTransport, DialError>;
}

/// Dials over TCP, bounded by `PeerConfig::connect_timeout`.
pub struct TcpDialer {
    config: PeerConfig,
}

impl TcpDialer {
    pub fn new(config: PeerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        address: SocketAddr,
        buffer: BytesMut,
    ) -> Result<PeerTransport, DialError> {
        let connect = TcpStream::connect(address);
        let stream = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let transient = is_transient(e.kind());
                return Err(DialError {
                    error: TorrentError::ConnectFailure {
                        address,
                        reason: e.to_string(),
                    },
                    buffer: transient.then_some(buffer),
                });
            }
            Err(_) => {
                return Err(DialError {
                    error: TorrentError::ConnectFailure {
                        address,
                        reason: format!("timed out after {:?}", self.config.connect_timeout),
                    },
                    buffer: Some(buffer),
                });
            }
        };

        TcpTransport::from_stream(stream, buffer, &self.config).map_err(|error| DialError {
            error,
            buffer: None,
        })
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::TimedOut
    )
}
