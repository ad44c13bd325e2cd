//! The one channel to the server
//!
//! [`Connection::connect`] performs the handshake inline so failures reach
//! the caller, then hands the transport to a background task that answers
//! keepalives, writes queued frames and forwards decoded inbound frames as
//! [`ConnectionEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{AppIdentity, Envelope, ServerEvent, UserData, CONNECTION, PONG};
use crate::transport::{Frame, Transport};

/// Event from the connection task
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A decoded server push or reply
    Server(ServerEvent),
    /// Transport or decode failure after the handshake
    Error(Error),
    /// The channel is gone; always the last event
    Closed,
}

enum Command {
    Send(Frame),
    Close,
}

/// Cloneable handle for sending on the connection
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Open a session over `transport`.
    ///
    /// Sends the handshake descriptor and waits up to `timeout` for the
    /// server's user data, answering pings meanwhile.
    pub async fn connect<T: Transport>(
        mut transport: T,
        identity: &AppIdentity,
        timeout: Duration,
        event_capacity: usize,
    ) -> Result<(Self, UserData, mpsc::Receiver<ConnectionEvent>)> {
        info!(app_key = %identity.app_key, "Connecting to server");

        let hello = Envelope::new(CONNECTION, identity)?.to_frame()?;
        transport
            .send(hello)
            .await
            .map_err(|e| Error::Transport(format!("Handshake send failed: {}", e)))?;

        let user = match tokio::time::timeout(timeout, handshake(&mut transport)).await {
            Ok(Ok(user)) => user,
            Ok(Err(e)) => {
                let _ = transport.close().await;
                return Err(e);
            }
            Err(_) => {
                let _ = transport.close().await;
                return Err(Error::Timeout(format!(
                    "No handshake reply within {} ms",
                    timeout.as_millis()
                )));
            }
        };
        info!(username = %user.username, nickname = %user.nickname, "Connected");

        let (event_tx, event_rx) = mpsc::channel(event_capacity.max(1));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(connection_task(transport, cmd_rx, event_tx, closed.clone()));

        Ok((Self { cmd_tx, closed }, user, event_rx))
    }

    /// Queue `{message: name, data: [payload]}`. No delivery ack.
    pub fn send(&self, name: &str, payload: impl Serialize) -> Result<()> {
        let frame = Envelope::new(name, payload)?.to_frame()?;
        self.queue(frame)
    }

    /// Queue raw bytes
    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.queue(Frame::Binary(bytes))
    }

    /// Close the channel. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn queue(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        self.cmd_tx
            .send(Command::Send(frame))
            .map_err(|_| Error::NotConnected)
    }
}

/// Wait for the first non-ping reply, which must be `getUserData`
async fn handshake<T: Transport>(transport: &mut T) -> Result<UserData> {
    loop {
        let frame = match transport.recv().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(Error::Transport(e.to_string())),
            None => return Err(Error::Transport("Closed during handshake".into())),
        };
        match ServerEvent::decode(frame)? {
            ServerEvent::Ping => {
                transport
                    .send(pong_frame()?)
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
            }
            ServerEvent::UserData(user) => return Ok(user),
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected handshake reply: {}",
                    other.name()
                )))
            }
        }
    }
}

fn pong_frame() -> Result<Frame> {
    Envelope::new(PONG, serde_json::json!({}))?.to_frame()
}

/// Main connection task
async fn connection_task<T: Transport>(
    mut transport: T,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            // Outgoing command
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = transport.send(frame).await {
                            warn!(error = %e, "Write error");
                            let _ = event_tx.send(ConnectionEvent::Error(Error::Transport(e.to_string()))).await;
                            break;
                        }
                    }
                    Some(Command::Close) | None => {
                        debug!("Close requested");
                        if let Err(e) = transport.close().await {
                            debug!(error = %e, "Transport close failed");
                        }
                        break;
                    }
                }
            }

            // Incoming frame from server
            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(frame)) => match ServerEvent::decode(frame) {
                        Ok(ServerEvent::Ping) => {
                            let pong = match pong_frame() {
                                Ok(pong) => pong,
                                Err(e) => {
                                    error!(error = %e, "Failed to encode pong");
                                    continue;
                                }
                            };
                            if let Err(e) = transport.send(pong).await {
                                warn!(error = %e, "Pong write error");
                                let _ = event_tx.send(ConnectionEvent::Error(Error::Transport(e.to_string()))).await;
                                break;
                            }
                        }
                        Ok(event) => {
                            if event_tx.send(ConnectionEvent::Server(event)).await.is_err() {
                                debug!("Event receiver dropped");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Dropping undecodable frame");
                            let _ = event_tx.send(ConnectionEvent::Error(e)).await;
                        }
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "Read error");
                        let _ = event_tx.send(ConnectionEvent::Error(Error::Transport(e.to_string()))).await;
                        break;
                    }
                    None => {
                        debug!("Server closed connection");
                        break;
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::Release);
    let _ = event_tx.send(ConnectionEvent::Closed).await;
    info!("Disconnected from server");
}
