//! Transport abstraction over the one channel to the server
//!
//! The engine only needs ordered delivery of text and binary frames. The
//! socket lifecycle (URL resolution, TLS, reconnects) belongs to whatever
//! implements [`Transport`]. [`TcpTransport`] is the bundled implementation
//! using length-prefixed framing.

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};

/// One unit on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON envelope `{message, data: [payload]}`
    Text(String),
    /// Unframed attachment bytes
    Binary(Vec<u8>),
}

/// Ordered, bidirectional frame channel
///
/// `recv` must be cancel safe: the connection task polls it inside
/// `tokio::select!` and drops the future whenever an outbound frame wins.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Next inbound frame. `None` means the peer closed cleanly.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    async fn close(&mut self) -> Result<()>;
}

/// Frames over a TCP stream
pub struct TcpTransport {
    writer: WriteHalf<TcpStream>,
    incoming: mpsc::Receiver<Result<Frame>>,
    reader: JoinHandle<()>,
}

impl TcpTransport {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        if let Ok(peer) = stream.peer_addr() {
            info!(addr = %peer, "TCP transport connected");
        }
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, incoming) = mpsc::channel(64);
        let reader = tokio::spawn(reader_task(reader, tx));
        Self {
            writer,
            incoming,
            reader,
        }
    }
}

/// Reads frames off the socket so `recv` never loses a partial frame
async fn reader_task(mut reader: ReadHalf<TcpStream>, tx: mpsc::Sender<Result<Frame>>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Err(Error::ConnectionClosed) => {
                debug!("Server closed connection");
                break;
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        write_frame(&mut self.writer, &frame).await
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.incoming.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        self.reader.abort();
        self.writer.shutdown().await?;
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
