//! Offer/answer exchange for one room
//!
//! Every offer the room sends gets a freshly minted tid, which becomes the
//! tracked tid. Answers we produce for server offers carry the tracked tid
//! instead of the one the server sent. An answer from the server is only
//! applied while the engine sits in `have-local-offer` and its tid equals the
//! tracked one; anything else belongs to a superseded exchange and is
//! dropped.
//!
//! All exchanges of a room run one at a time under a fair mutex, so local
//! offers and server offers are handled in arrival order and never overlap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use convene_core::invariants::assert_fresh_tid;
use convene_core::{mint_tid, sdp, TrackLabel};

use crate::error::{Error, Result};
use crate::media::{MediaEngine, SignalingState};
use crate::protocol::{Operation, SdpMessage, SdpType, SessionDescription};
use crate::signaling::Signaling;

#[derive(Debug, Default)]
struct Exchange {
    tid: Option<String>,
    /// Labels of the last local offer, reused when re-offering after a
    /// collision
    labels: Vec<TrackLabel>,
}

pub(crate) struct Negotiator {
    room_id: String,
    engine: Arc<dyn MediaEngine>,
    signaling: Signaling,
    exchange: Mutex<Exchange>,
    step_timeout: Option<Duration>,
}

impl Negotiator {
    pub fn new(
        room_id: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        signaling: Signaling,
        step_timeout: Option<Duration>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            engine,
            signaling,
            exchange: Mutex::new(Exchange::default()),
            step_timeout,
        }
    }

    pub async fn tracked_tid(&self) -> Option<String> {
        self.exchange.lock().await.tid.clone()
    }

    /// Send a local offer under `operation`, correlated with `request_id`.
    ///
    /// If any step fails the request is rejected with the error and `None`
    /// is returned; the caller still observes the outcome through its
    /// ticket.
    pub async fn offer(
        &self,
        operation: Operation,
        request_id: &str,
        labels: &[TrackLabel],
        extra: Map<String, Value>,
    ) -> Option<String> {
        let mut exchange = self.exchange.lock().await;
        match self
            .send_offer(&mut exchange, operation, Some(request_id), labels, extra)
            .await
        {
            Ok(tid) => Some(tid),
            Err(e) => {
                warn!(room_id = %self.room_id, operation = %operation, error = %e, "Local offer failed");
                self.signaling.reject(request_id, e);
                None
            }
        }
    }

    /// React to an offer pushed by the server
    pub async fn handle_remote_offer(&self, msg: SdpMessage) {
        let mut exchange = self.exchange.lock().await;
        if let Err(e) = self.answer(&mut exchange, msg).await {
            error!(room_id = %self.room_id, error = %e, "Failed to answer server offer");
        }
    }

    /// Apply an answer pushed by the server.
    ///
    /// Returns [`Error::StaleNegotiation`] when the answer does not match the
    /// exchange in flight; the engine is left untouched in that case.
    pub async fn handle_remote_answer(&self, msg: SdpMessage) -> Result<()> {
        let exchange = self.exchange.lock().await;
        let state = self.engine.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            return Err(Error::StaleNegotiation(format!(
                "answer {} arrived in {:?}",
                msg.tid, state
            )));
        }
        if exchange.tid.as_deref() != Some(msg.tid.as_str()) {
            return Err(Error::StaleNegotiation(format!(
                "answer {} does not match tracked tid {:?}",
                msg.tid, exchange.tid
            )));
        }
        self.step("set remote answer", self.engine.set_remote_description(msg.description()))
            .await?;
        debug!(room_id = %self.room_id, tid = %msg.tid, "Applied server answer");
        Ok(())
    }

    /// Route an SDP push by type
    pub async fn handle(&self, msg: SdpMessage) {
        match msg.kind {
            SdpType::Offer => self.handle_remote_offer(msg).await,
            SdpType::Answer => {
                if let Err(e) = self.handle_remote_answer(msg).await {
                    match e {
                        Error::StaleNegotiation(reason) => {
                            debug!(room_id = %self.room_id, reason = %reason, "Dropping stale answer");
                        }
                        other => {
                            error!(room_id = %self.room_id, error = %other, "Failed to apply server answer");
                        }
                    }
                }
            }
            SdpType::Rollback => {
                warn!(room_id = %self.room_id, tid = %msg.tid, "Ignoring rollback pushed by server")
            }
        }
    }

    async fn send_offer(
        &self,
        exchange: &mut Exchange,
        operation: Operation,
        request_id: Option<&str>,
        labels: &[TrackLabel],
        extra: Map<String, Value>,
    ) -> Result<String> {
        let offer = self.step("create offer", self.engine.create_offer()).await?;
        let munged = sdp::force_send_only(&sdp::annotate_labels(&offer.sdp, labels));
        let offer = SessionDescription::offer(munged);
        self.step("set local offer", self.engine.set_local_description(offer.clone()))
            .await?;

        let tid = mint_tid();
        assert_fresh_tid(exchange.tid.as_deref(), &tid);
        exchange.tid = Some(tid.clone());
        exchange.labels = labels.to_vec();

        let mut msg = SdpMessage::new(self.room_id.clone(), offer, tid.clone());
        msg.extra = extra;
        if let Some(id) = request_id {
            msg = msg.with_id(id);
        }
        self.signaling.send(operation.as_str(), &msg)?;
        debug!(room_id = %self.room_id, operation = %operation, tid = %tid, "Sent local offer");
        Ok(tid)
    }

    async fn answer(&self, exchange: &mut Exchange, msg: SdpMessage) -> Result<()> {
        let collided = self.engine.signaling_state() == SignalingState::HaveLocalOffer;
        if collided {
            info!(room_id = %self.room_id, tid = %msg.tid, "Offer collision, rolling back local offer");
            self.step(
                "rollback",
                self.engine.set_local_description(SessionDescription::rollback()),
            )
            .await?;
        }

        self.step("set remote offer", self.engine.set_remote_description(msg.description()))
            .await?;
        let answer = self.step("create answer", self.engine.create_answer()).await?;
        let answer = SessionDescription::answer(sdp::force_send_only(&answer.sdp));
        self.step("set local answer", self.engine.set_local_description(answer.clone()))
            .await?;

        // The reply keeps the tracked tid, not the one on the server's offer
        let tid = exchange.tid.clone().unwrap_or_else(|| msg.tid.clone());
        let reply = SdpMessage::new(self.room_id.clone(), answer, tid.clone());
        self.signaling.send(Operation::UpdateRoomState.as_str(), &reply)?;
        debug!(room_id = %self.room_id, tid = %tid, "Answered server offer");

        if collided {
            let labels = exchange.labels.clone();
            self.send_offer(exchange, Operation::UpdateRoomState, None, &labels, Map::new())
                .await?;
        }
        Ok(())
    }

    async fn step<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.step_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Error::Timeout(format!("{} in room {}", what, self.room_id)))?,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected, MockEngine, MockServer};
    use serde_json::json;

    async fn setup() -> (Negotiator, Arc<MockEngine>, Signaling, MockServer) {
        let (conn, server, _events) = connected().await;
        let signaling = Signaling::new(conn, Some(Duration::from_secs(1)));
        let engine = MockEngine::new();
        let negotiator = Negotiator::new("r1", engine.clone(), signaling.clone(), Some(Duration::from_secs(1)));
        (negotiator, engine, signaling, server)
    }

    fn server_sdp(kind: SdpType, tid: &str) -> SdpMessage {
        let desc = SessionDescription {
            kind,
            sdp: "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:s0\r\na=sendrecv\r\n".into(),
        };
        SdpMessage::new("r1", desc, tid)
    }

    #[tokio::test]
    async fn test_offer_mints_tid_and_forces_send_only() {
        let (negotiator, engine, signaling, mut server) = setup().await;
        let ticket = signaling.register().unwrap();

        let labels = vec![TrackLabel::new("local", "camera")];
        let tid = negotiator
            .offer(Operation::UpdateRoomState, &ticket.id, &labels, Map::new())
            .await
            .unwrap();

        let sent = server.expect("updateRoomState").await;
        assert_eq!(sent["tid"], tid.as_str());
        assert_eq!(sent["id"], ticket.id.as_str());
        assert_eq!(sent["type"], "offer");
        let sdp_text = sent["sdp"].as_str().unwrap();
        assert!(sdp_text.contains("a=sendonly"));
        assert!(!sdp_text.contains("a=sendrecv"));
        assert!(sdp_text.contains("a=label:camera"));
        assert_eq!(negotiator.tracked_tid().await, Some(tid.clone()));
        assert_eq!(engine.state(), SignalingState::HaveLocalOffer);

        let second = negotiator
            .offer(Operation::UpdateRoomState, &ticket.id, &[], Map::new())
            .await
            .unwrap();
        assert_ne!(second, tid);
    }

    #[tokio::test]
    async fn test_matching_answer_applied_stale_answer_dropped() {
        let (negotiator, engine, signaling, _server) = setup().await;
        let ticket = signaling.register().unwrap();
        let tid1 = negotiator
            .offer(Operation::JoinRoom, &ticket.id, &[], Map::new())
            .await
            .unwrap();
        let tid2 = negotiator
            .offer(Operation::UpdateRoomState, &ticket.id, &[], Map::new())
            .await
            .unwrap();

        let err = negotiator
            .handle_remote_answer(server_sdp(SdpType::Answer, &tid1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleNegotiation(_)));
        assert_eq!(engine.state(), SignalingState::HaveLocalOffer);
        assert!(engine.remote().is_none());

        negotiator
            .handle_remote_answer(server_sdp(SdpType::Answer, &tid2))
            .await
            .unwrap();
        assert_eq!(engine.state(), SignalingState::Stable);

        // A repeat of the right tid after completion is stale too
        let err = negotiator
            .handle_remote_answer(server_sdp(SdpType::Answer, &tid2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleNegotiation(_)));
    }

    #[tokio::test]
    async fn test_remote_offer_answered_with_tracked_tid() {
        let (negotiator, engine, signaling, mut server) = setup().await;
        let ticket = signaling.register().unwrap();
        let tid = negotiator
            .offer(Operation::JoinRoom, &ticket.id, &[], Map::new())
            .await
            .unwrap();
        server.expect("joinRoom").await;
        negotiator.handle_remote_answer(server_sdp(SdpType::Answer, &tid)).await.unwrap();

        negotiator.handle_remote_offer(server_sdp(SdpType::Offer, "server-tid")).await;

        let reply = server.expect("updateRoomState").await;
        assert_eq!(reply["type"], "answer");
        assert_eq!(reply["tid"], tid.as_str());
        assert!(reply.get("id").is_none());
        assert!(!reply["sdp"].as_str().unwrap().contains("a=sendrecv"));
        assert_eq!(engine.rollbacks(), 0);
        assert_eq!(engine.state(), SignalingState::Stable);
        assert!(server.try_next().is_none());
    }

    #[tokio::test]
    async fn test_collision_rolls_back_answers_then_reoffers() {
        let (negotiator, engine, signaling, mut server) = setup().await;
        let ticket = signaling.register().unwrap();
        let tid1 = negotiator
            .offer(Operation::UpdateRoomState, &ticket.id, &[], Map::new())
            .await
            .unwrap();
        server.expect("updateRoomState").await;
        assert_eq!(engine.state(), SignalingState::HaveLocalOffer);

        negotiator.handle_remote_offer(server_sdp(SdpType::Offer, "server-tid")).await;

        assert_eq!(engine.rollbacks(), 1);

        let answer = server.expect("updateRoomState").await;
        assert_eq!(answer["type"], "answer");
        assert_eq!(answer["tid"], tid1.as_str());

        let reoffer = server.expect("updateRoomState").await;
        assert_eq!(reoffer["type"], "offer");
        let tid2 = reoffer["tid"].as_str().unwrap().to_string();
        assert_ne!(tid2, tid1);
        assert!(reoffer.get("id").is_none());
        assert!(server.try_next().is_none());

        assert_eq!(negotiator.tracked_tid().await, Some(tid2.clone()));
        assert_eq!(engine.state(), SignalingState::HaveLocalOffer);

        // The answer to the superseded offer is dropped, the new one applies
        assert!(negotiator.handle_remote_answer(server_sdp(SdpType::Answer, &tid1)).await.is_err());
        negotiator.handle_remote_answer(server_sdp(SdpType::Answer, &tid2)).await.unwrap();
        assert_eq!(engine.state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_offer_failure_rejects_request() {
        let (negotiator, engine, signaling, mut server) = setup().await;
        engine.fail_next_offer();
        let ticket = signaling.register().unwrap();
        let id = ticket.id.clone();

        assert!(negotiator
            .offer(Operation::JoinRoom, &id, &[], Map::new())
            .await
            .is_none());
        assert!(matches!(signaling.wait(ticket).await, Err(Error::Media(_))));
        assert!(negotiator.tracked_tid().await.is_none());
        assert!(server.try_next().is_none());

        // The room is usable again afterwards
        let ticket = signaling.register().unwrap();
        assert!(negotiator
            .offer(Operation::JoinRoom, &ticket.id, &[], Map::new())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_step_timeout_rejects_and_releases_exchange() {
        let (conn, mut server, _events) = connected().await;
        let signaling = Signaling::new(conn, Some(Duration::from_secs(1)));
        let engine = MockEngine::new();
        let negotiator = Negotiator::new("r1", engine.clone(), signaling.clone(), Some(Duration::from_millis(50)));
        engine.stall_next_offer();
        let ticket = signaling.register().unwrap();
        let id = ticket.id.clone();

        assert!(negotiator
            .offer(Operation::JoinRoom, &id, &[], Map::new())
            .await
            .is_none());
        assert!(matches!(signaling.wait(ticket).await, Err(Error::Timeout(_))));
        assert!(negotiator.tracked_tid().await.is_none());
        assert_eq!(engine.state(), SignalingState::Stable);
        assert!(server.try_next().is_none());

        // Nothing is tracked, so the answer echoes the server's tid
        negotiator.handle_remote_offer(server_sdp(SdpType::Offer, "server-tid")).await;
        let reply = server.expect("updateRoomState").await;
        assert_eq!(reply["type"], "answer");
        assert_eq!(reply["tid"], "server-tid");
    }

    #[tokio::test]
    async fn test_remote_offer_failure_releases_exchange() {
        let (negotiator, engine, signaling, mut server) = setup().await;
        engine.fail_next_remote();

        negotiator.handle_remote_offer(server_sdp(SdpType::Offer, "server-tid")).await;
        assert_eq!(engine.state(), SignalingState::Stable);
        assert!(engine.remote().is_none());
        assert!(server.try_next().is_none());

        let ticket = signaling.register().unwrap();
        let tid = tokio::time::timeout(
            Duration::from_secs(1),
            negotiator.offer(Operation::UpdateRoomState, &ticket.id, &[], Map::new()),
        )
        .await
        .unwrap()
        .unwrap();
        let sent = server.expect("updateRoomState").await;
        assert_eq!(sent["tid"], tid.as_str());
    }

    #[tokio::test]
    async fn test_offer_carries_extra_fields() {
        let (negotiator, _engine, signaling, mut server) = setup().await;
        let ticket = signaling.register().unwrap();
        let mut extra = Map::new();
        extra.insert("pin".into(), json!("1234"));
        negotiator.offer(Operation::JoinRoom, &ticket.id, &[], extra).await.unwrap();

        let sent = server.expect("joinRoom").await;
        assert_eq!(sent["pin"], "1234");
        assert_eq!(sent["roomId"], "r1");
    }
}
