//! In-memory server and media engine doubles for unit tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use convene_core::{Direction, MediaKind};

use crate::connection::{Connection, ConnectionEvent};
use crate::error::{Error, Result};
use crate::media::{
    ControlChannel, DataChannel, MediaConnectionState, MediaEngine, SignalingState, TransceiverHandle,
};
use crate::protocol::{server_frame, AppIdentity, Envelope, SdpType, SessionDescription, CONNECTION};
use crate::transport::{Frame, Transport};

const WAIT: Duration = Duration::from_secs(2);

/// Client half of an in-memory frame pipe
pub(crate) struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.outgoing.send(frame).map_err(|_| Error::ConnectionClosed)
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.incoming.close();
        Ok(())
    }
}

/// Server half: scripted pushes and inspection of what the client sent
pub(crate) struct MockServer {
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl MockServer {
    pub fn push(&self, name: &str, payload: Value) {
        let frame = server_frame(name, payload).expect("encode server frame");
        let _ = self.to_client.send(frame);
    }

    pub fn push_binary(&self, bytes: Vec<u8>) {
        let _ = self.to_client.send(Frame::Binary(bytes));
    }

    pub async fn next(&mut self) -> Frame {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client hung up")
    }

    pub async fn next_envelope(&mut self) -> Envelope {
        match self.next().await {
            Frame::Text(text) => Envelope::parse(&text).expect("client sent invalid envelope"),
            Frame::Binary(bytes) => panic!("expected text frame, got {} bytes", bytes.len()),
        }
    }

    /// Next frame must be the envelope `name`; returns its payload
    pub async fn expect(&mut self, name: &str) -> Value {
        let envelope = self.next_envelope().await;
        assert_eq!(envelope.message, name, "payload: {}", envelope.payload());
        envelope.payload().clone()
    }

    pub async fn next_binary(&mut self) -> Vec<u8> {
        match self.next().await {
            Frame::Binary(bytes) => bytes,
            Frame::Text(text) => panic!("expected binary frame, got {}", text),
        }
    }

    /// Next client frame, or `None` if nothing arrives within `wait`
    pub async fn next_within(&mut self, wait: Duration) -> Option<Frame> {
        tokio::time::timeout(wait, self.from_client.recv()).await.ok().flatten()
    }

    /// A frame already queued by the client, without waiting
    pub fn try_next(&mut self) -> Option<Frame> {
        self.from_client.try_recv().ok()
    }

    pub fn ack(&self, id: &str) {
        self.push("ACK", json!({ "id": id }));
    }
}

pub(crate) fn mock_pair() -> (MockTransport, MockServer) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_client) = mpsc::unbounded_channel();
    (
        MockTransport { incoming, outgoing },
        MockServer {
            to_client,
            from_client,
        },
    )
}

pub(crate) fn user_data_json(username: &str, nickname: &str) -> Value {
    json!({ "username": username, "nickname": nickname, "sessionId": "s-1" })
}

/// A connection that has completed its handshake as `alice`
pub(crate) async fn connected() -> (Connection, MockServer, mpsc::Receiver<ConnectionEvent>) {
    let (transport, mut server) = mock_pair();
    server.push("getUserData", user_data_json("alice", "Alice"));
    let (conn, _user, events) = Connection::connect(transport, &AppIdentity::new("test"), WAIT, 64)
        .await
        .expect("handshake");
    server.expect(CONNECTION).await;
    (conn, server, events)
}

struct MockChannel {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl DataChannel for MockChannel {
    async fn send(&self, text: String) -> Result<()> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }
}

struct EngineInner {
    state: SignalingState,
    transceivers: Vec<TransceiverHandle>,
    remote: Option<SessionDescription>,
    offers: usize,
    rollbacks: usize,
    fail_next_offer: bool,
    stall_next_offer: bool,
    fail_next_remote: bool,
    chat_inbound: Option<mpsc::UnboundedSender<String>>,
    closed: bool,
}

/// Media engine that follows the offer/answer state machine without media
pub(crate) struct MockEngine {
    inner: Mutex<EngineInner>,
    chat_sent: Arc<Mutex<Vec<String>>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(EngineInner {
                state: SignalingState::Stable,
                transceivers: Vec::new(),
                remote: None,
                offers: 0,
                rollbacks: 0,
                fail_next_offer: false,
                stall_next_offer: false,
                fail_next_remote: false,
                chat_inbound: None,
                closed: false,
            }),
            chat_sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn state(&self) -> SignalingState {
        self.inner.lock().unwrap().state
    }

    pub fn offers(&self) -> usize {
        self.inner.lock().unwrap().offers
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.lock().unwrap().rollbacks
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.inner.lock().unwrap().remote.clone()
    }

    pub fn transceivers(&self) -> Vec<TransceiverHandle> {
        self.inner.lock().unwrap().transceivers.clone()
    }

    pub fn fail_next_offer(&self) {
        self.inner.lock().unwrap().fail_next_offer = true;
    }

    /// The next `create_offer` never completes
    pub fn stall_next_offer(&self) {
        self.inner.lock().unwrap().stall_next_offer = true;
    }

    /// The next `set_remote_description` fails and leaves the state alone
    pub fn fail_next_remote(&self) {
        self.inner.lock().unwrap().fail_next_remote = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn chat_sent(&self) -> Vec<String> {
        self.chat_sent.lock().unwrap().clone()
    }

    /// Deliver a data channel message as if the SFU sent it
    pub fn inject_chat(&self, text: impl Into<String>) {
        if let Some(tx) = &self.inner.lock().unwrap().chat_inbound {
            let _ = tx.send(text.into());
        }
    }

    fn render(transceivers: &[TransceiverHandle]) -> String {
        let mut sdp = String::from("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:local\r\na=sendrecv\r\n");
        for t in transceivers {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\na=recvonly\r\n",
                t.kind.as_str(),
                t.mid
            ));
        }
        sdp
    }
}

fn wrong_state(op: &str, state: SignalingState) -> Error {
    Error::Media(format!("{} not allowed in {:?}", op, state))
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let stalled = {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_next_offer {
                inner.fail_next_offer = false;
                return Err(Error::Media("offer creation failed".into()));
            }
            std::mem::take(&mut inner.stall_next_offer)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.offers += 1;
        Ok(SessionDescription::offer(Self::render(&inner.transceivers)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let inner = self.inner.lock().unwrap();
        if inner.state != SignalingState::HaveRemoteOffer {
            return Err(wrong_state("create_answer", inner.state));
        }
        Ok(SessionDescription::answer(Self::render(&inner.transceivers)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let next = match (desc.kind, inner.state) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                inner.rollbacks += 1;
                inner.state = SignalingState::Stable;
                return Ok(());
            }
            (_, state) => return Err(wrong_state("set_local_description", state)),
        };
        inner.state = next;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if std::mem::take(&mut inner.fail_next_remote) {
            return Err(Error::Media("remote description rejected".into()));
        }
        let next = match (desc.kind, inner.state) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (_, state) => return Err(wrong_state("set_remote_description", state)),
        };
        inner.state = next;
        inner.remote = Some(desc);
        Ok(())
    }

    async fn add_transceiver(&self, kind: MediaKind, _direction: Direction) -> Result<TransceiverHandle> {
        let mut inner = self.inner.lock().unwrap();
        let handle = TransceiverHandle {
            mid: inner.transceivers.len().to_string(),
            kind,
        };
        inner.transceivers.push(handle.clone());
        Ok(handle)
    }

    async fn create_data_channel(&self, _label: &str) -> Result<ControlChannel> {
        let (tx, incoming) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().chat_inbound = Some(tx);
        Ok(ControlChannel {
            sender: Arc::new(MockChannel {
                sent: self.chat_sent.clone(),
            }),
            incoming,
        })
    }

    fn signaling_state(&self) -> SignalingState {
        self.state()
    }

    fn connection_state(&self) -> MediaConnectionState {
        if self.is_closed() {
            MediaConnectionState::Closed
        } else {
            MediaConnectionState::Connected
        }
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.state = SignalingState::Closed;
        inner.chat_inbound = None;
        Ok(())
    }
}
