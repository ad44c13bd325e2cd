//! Transceiver lease pool
//!
//! Receive slots are pre-allocated when a room joins so that subscribing to
//! a remote track usually needs no renegotiation. A [`RemoteTrack`] holds
//! its slot until it is disposed or dropped, then the slot goes back to the
//! pool in release order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tracing::debug;

use convene_core::{Direction, MediaKind, PoolConfig, Quality};

use crate::error::{Error, Result};
use crate::media::{MediaEngine, TransceiverHandle};
use crate::protocol::Operation;
use crate::signaling::Signaling;

#[derive(Debug, Default)]
struct Vacant {
    audio: VecDeque<TransceiverHandle>,
    video: VecDeque<TransceiverHandle>,
}

impl Vacant {
    fn queue(&mut self, kind: MediaKind) -> &mut VecDeque<TransceiverHandle> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }
}

/// Free receive slots per media kind, handed out first in first out
#[derive(Debug, Default)]
pub struct TransceiverPool {
    vacant: Mutex<Vacant>,
}

impl TransceiverPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the configured number of receive-only transceivers to `engine`
    pub async fn seed(engine: &dyn MediaEngine, config: &PoolConfig) -> Result<Self> {
        let pool = Self::new();
        for (kind, count) in [(MediaKind::Audio, config.audio), (MediaKind::Video, config.video)] {
            for _ in 0..count {
                let slot = engine.add_transceiver(kind, Direction::RecvOnly).await?;
                pool.put(slot);
            }
        }
        debug!(audio = config.audio, video = config.video, "Seeded transceiver pool");
        Ok(pool)
    }

    pub fn take(&self, kind: MediaKind) -> Option<TransceiverHandle> {
        self.lock().queue(kind).pop_front()
    }

    pub fn put(&self, slot: TransceiverHandle) {
        let kind = slot.kind;
        self.lock().queue(kind).push_back(slot);
    }

    pub fn vacant(&self, kind: MediaKind) -> usize {
        self.lock().queue(kind).len()
    }

    pub fn clear(&self) {
        let mut vacant = self.lock();
        vacant.audio.clear();
        vacant.video.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vacant> {
        self.vacant.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Default)]
struct TrackState {
    remote_id: Option<String>,
    preferred_quality: Option<Quality>,
    /// Temporal layer requested along with the quality
    tid: Option<u32>,
    muted: bool,
    disposed: bool,
}

/// A leased receive slot bound (or bindable) to one remote track
pub struct RemoteTrack {
    room_id: String,
    slot: TransceiverHandle,
    pool: Arc<TransceiverPool>,
    signaling: Signaling,
    state: Mutex<TrackState>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("room_id", &self.room_id)
            .field("slot", &self.slot)
            .field("state", &*self.lock())
            .finish()
    }
}

impl RemoteTrack {
    pub(crate) fn lease(
        room_id: impl Into<String>,
        slot: TransceiverHandle,
        pool: Arc<TransceiverPool>,
        signaling: Signaling,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            slot,
            pool,
            signaling,
            state: Mutex::new(TrackState::default()),
        }
    }

    pub fn mid(&self) -> &str {
        &self.slot.mid
    }

    pub fn kind(&self) -> MediaKind {
        self.slot.kind
    }

    pub fn remote_id(&self) -> Option<String> {
        self.lock().remote_id.clone()
    }

    pub fn preferred_quality(&self) -> Option<Quality> {
        self.lock().preferred_quality.clone()
    }

    pub fn tid(&self) -> Option<u32> {
        self.lock().tid
    }

    pub fn is_muted(&self) -> bool {
        self.lock().muted
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Ask the server to forward `remote_id` on this slot.
    ///
    /// Demanding the track already bound is a no-op; a different id rebinds.
    pub async fn demand_track(&self, remote_id: &str) -> Result<()> {
        {
            let state = self.live()?;
            if state.remote_id.as_deref() == Some(remote_id) {
                return Ok(());
            }
        }
        self.signaling
            .request(
                Operation::DemandTrack,
                json!({ "roomId": self.room_id, "mid": self.slot.mid, "trackId": remote_id }),
            )
            .await?;
        self.live()?.remote_id = Some(remote_id.to_string());
        Ok(())
    }

    pub async fn mute(&self) -> Result<()> {
        self.set_muted(true).await
    }

    pub async fn unmute(&self) -> Result<()> {
        self.set_muted(false).await
    }

    /// Request a simulcast layer and, optionally, a temporal layer
    pub async fn set_preferred_quality(&self, quality: Quality, tid: Option<u32>) -> Result<()> {
        let track_id = self.bound_id()?;
        self.signaling
            .request(
                Operation::ChangeQuality,
                json!({
                    "roomId": self.room_id,
                    "mid": self.slot.mid,
                    "trackId": track_id,
                    "quality": quality.as_str(),
                    "tid": tid,
                }),
            )
            .await?;
        let mut state = self.live()?;
        state.preferred_quality = Some(quality);
        state.tid = tid;
        Ok(())
    }

    /// Return the slot to the pool. A second call fails.
    pub fn dispose(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.disposed {
                return Err(Error::AlreadyDisposed);
            }
            state.disposed = true;
        }
        debug!(room_id = %self.room_id, mid = %self.slot.mid, "Releasing transceiver");
        self.pool.put(self.slot.clone());
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<()> {
        let track_id = self.bound_id()?;
        self.signaling
            .request(
                Operation::ChangeTrackState,
                json!({ "roomId": self.room_id, "mid": self.slot.mid, "trackId": track_id, "mute": muted }),
            )
            .await?;
        self.live()?.muted = muted;
        Ok(())
    }

    fn bound_id(&self) -> Result<String> {
        self.live()?
            .remote_id
            .clone()
            .ok_or_else(|| Error::Rejected(format!("slot {} is not bound to a track", self.slot.mid)))
    }

    fn live(&self) -> Result<MutexGuard<'_, TrackState>> {
        let state = self.lock();
        if state.disposed {
            return Err(Error::AlreadyDisposed);
        }
        Ok(state)
    }

    fn lock(&self) -> MutexGuard<'_, TrackState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RemoteTrack {
    fn drop(&mut self) {
        if !self.lock().disposed {
            self.pool.put(self.slot.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected, MockEngine};
    use std::time::Duration;

    fn slot(mid: &str, kind: MediaKind) -> TransceiverHandle {
        TransceiverHandle {
            mid: mid.into(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_seed_adds_configured_slots() {
        let engine = MockEngine::new();
        let pool = TransceiverPool::seed(engine.as_ref(), &PoolConfig { audio: 1, video: 2 })
            .await
            .unwrap();
        assert_eq!(pool.vacant(MediaKind::Audio), 1);
        assert_eq!(pool.vacant(MediaKind::Video), 2);
        assert_eq!(engine.transceivers().len(), 3);
    }

    #[test]
    fn test_take_is_fifo_per_kind() {
        let pool = TransceiverPool::new();
        pool.put(slot("v1", MediaKind::Video));
        pool.put(slot("a1", MediaKind::Audio));
        pool.put(slot("v2", MediaKind::Video));

        assert_eq!(pool.take(MediaKind::Video).unwrap().mid, "v1");
        assert_eq!(pool.take(MediaKind::Video).unwrap().mid, "v2");
        assert!(pool.take(MediaKind::Video).is_none());
        assert_eq!(pool.take(MediaKind::Audio).unwrap().mid, "a1");
    }

    #[tokio::test]
    async fn test_dispose_twice_fails_and_returns_slot_once() {
        let (conn, _server, _events) = connected().await;
        let signaling = Signaling::new(conn, None);
        let pool = Arc::new(TransceiverPool::new());
        pool.put(slot("v1", MediaKind::Video));

        let leased = pool.take(MediaKind::Video).unwrap();
        let track = RemoteTrack::lease("r1", leased, pool.clone(), signaling);
        assert_eq!(pool.vacant(MediaKind::Video), 0);

        track.dispose().unwrap();
        assert!(matches!(track.dispose(), Err(Error::AlreadyDisposed)));
        assert!(matches!(track.demand_track("t").await, Err(Error::AlreadyDisposed)));
        drop(track);
        assert_eq!(pool.vacant(MediaKind::Video), 1);
    }

    #[tokio::test]
    async fn test_drop_returns_slot() {
        let (conn, _server, _events) = connected().await;
        let pool = Arc::new(TransceiverPool::new());
        let track = RemoteTrack::lease("r1", slot("a1", MediaKind::Audio), pool.clone(), Signaling::new(conn, None));
        drop(track);
        assert_eq!(pool.take(MediaKind::Audio).unwrap().mid, "a1");
    }

    #[tokio::test]
    async fn test_demand_is_idempotent_and_rebinds() {
        let (conn, mut server, _events) = connected().await;
        let signaling = Signaling::new(conn, Some(Duration::from_secs(1)));
        let pool = Arc::new(TransceiverPool::new());
        let track = Arc::new(RemoteTrack::lease("r1", slot("v1", MediaKind::Video), pool, signaling.clone()));

        let t = track.clone();
        let call = tokio::spawn(async move { t.demand_track("remote-a").await });
        let sent = server.expect("demandTrack").await;
        assert_eq!(sent["mid"], "v1");
        assert_eq!(sent["trackId"], "remote-a");
        signaling.resolve(sent["id"].as_str().unwrap(), serde_json::Value::Null);
        call.await.unwrap().unwrap();
        assert_eq!(track.remote_id().as_deref(), Some("remote-a"));

        // Same id: nothing goes out
        track.demand_track("remote-a").await.unwrap();
        assert!(server.try_next().is_none());

        let t = track.clone();
        let call = tokio::spawn(async move { t.demand_track("remote-b").await });
        let sent = server.expect("demandTrack").await;
        assert_eq!(sent["trackId"], "remote-b");
        signaling.resolve(sent["id"].as_str().unwrap(), serde_json::Value::Null);
        call.await.unwrap().unwrap();
        assert_eq!(track.remote_id().as_deref(), Some("remote-b"));
    }

    #[tokio::test]
    async fn test_mute_and_quality_require_binding() {
        let (conn, mut server, _events) = connected().await;
        let signaling = Signaling::new(conn, Some(Duration::from_secs(1)));
        let pool = Arc::new(TransceiverPool::new());
        let track = Arc::new(RemoteTrack::lease("r1", slot("v1", MediaKind::Video), pool, signaling.clone()));

        assert!(matches!(track.mute().await, Err(Error::Rejected(_))));

        let t = track.clone();
        let call = tokio::spawn(async move { t.demand_track("remote-a").await });
        let sent = server.expect("demandTrack").await;
        signaling.resolve(sent["id"].as_str().unwrap(), serde_json::Value::Null);
        call.await.unwrap().unwrap();

        let t = track.clone();
        let call = tokio::spawn(async move { t.mute().await });
        let sent = server.expect("changeTrackState").await;
        assert_eq!(sent["mute"], true);
        signaling.resolve(sent["id"].as_str().unwrap(), serde_json::Value::Null);
        call.await.unwrap().unwrap();
        assert!(track.is_muted());

        let t = track.clone();
        let call = tokio::spawn(async move { t.set_preferred_quality(Quality::new("h"), Some(1)).await });
        let sent = server.expect("changeQuality").await;
        assert_eq!(sent["quality"], "h");
        assert_eq!(sent["tid"], 1);
        signaling.resolve(sent["id"].as_str().unwrap(), serde_json::Value::Null);
        call.await.unwrap().unwrap();
        assert_eq!(track.preferred_quality(), Some(Quality::new("h")));
        assert_eq!(track.tid(), Some(1));
    }
}
