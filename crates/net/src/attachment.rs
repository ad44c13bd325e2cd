//! Attachment transfers over binary frames
//!
//! Attachments travel as raw binary frames with a three byte header: the
//! command, the slot id the transfer runs on, and the end-of-transfer flag.
//! Uploads are chunked and may be cancelled until their last chunk is handed
//! to the transport. Downloads are requested over signaling and reassembled
//! per slot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use convene_core::chunk::split_bytes;
use convene_core::{AttachmentChunk, AttachmentCommand, PendingRequests, Reassembler};

use crate::error::{Error, Result};
use crate::protocol::Operation;
use crate::signaling::Signaling;

/// Progress of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Created, no chunk sent yet
    Pending,
    Uploading,
    /// The last chunk was handed to the transport
    Uploaded,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransferState::Uploaded | TransferState::Cancelled | TransferState::Failed
        )
    }
}

/// Handle to an upload running in the background
#[derive(Debug)]
pub struct AttachmentUpload {
    slot_id: u8,
    state: Arc<watch::Sender<TransferState>>,
}

impl AttachmentUpload {
    pub(crate) fn start(
        signaling: Signaling,
        slot_id: u8,
        data: &[u8],
        chunk_size: usize,
        pacing: Option<Duration>,
    ) -> Self {
        let (state, _) = watch::channel(TransferState::Pending);
        let state = Arc::new(state);
        let chunks = split_bytes(slot_id, data, chunk_size);
        debug!(slot_id, bytes = data.len(), chunks = chunks.len(), "Starting upload");
        tokio::spawn(upload_task(signaling, state.clone(), slot_id, chunks, pacing));
        Self { slot_id, state }
    }

    pub fn slot_id(&self) -> u8 {
        self.slot_id
    }

    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// Stop the upload. Fails once the last chunk has gone out.
    pub fn cancel(&self) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state {
            TransferState::Pending | TransferState::Uploading => {
                *state = TransferState::Cancelled;
                true
            }
            TransferState::Uploaded => {
                outcome = Err(Error::Rejected(format!(
                    "upload on slot {} already completed",
                    self.slot_id
                )));
                false
            }
            TransferState::Cancelled | TransferState::Failed => false,
        });
        outcome
    }

    /// Wait until the upload completes, fails or is cancelled
    pub async fn finished(&self) -> TransferState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(TransferState::is_finished).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }
}

fn advance(state: &watch::Sender<TransferState>, from: TransferState, to: TransferState) -> bool {
    state.send_if_modified(|current| {
        if *current == from {
            *current = to;
            true
        } else {
            false
        }
    })
}

async fn upload_task(
    signaling: Signaling,
    state: Arc<watch::Sender<TransferState>>,
    slot_id: u8,
    chunks: Vec<AttachmentChunk>,
    pacing: Option<Duration>,
) {
    if !advance(&state, TransferState::Pending, TransferState::Uploading) {
        debug!(slot_id, "Upload cancelled before the first chunk");
        return;
    }

    let count = chunks.len();
    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 {
            if let Some(pause) = pacing {
                tokio::time::sleep(pause).await;
            }
        }
        // Uploaded is committed before the last chunk goes out
        let last = i + 1 == count;
        let proceed = if last {
            advance(&state, TransferState::Uploading, TransferState::Uploaded)
        } else {
            *state.borrow() == TransferState::Uploading
        };
        if !proceed {
            info!(slot_id, sent = i, "Upload cancelled");
            if let Err(e) = signaling.send_binary(AttachmentChunk::cancel(slot_id).encode()) {
                debug!(slot_id, error = %e, "Could not send cancel frame");
            }
            return;
        }
        if let Err(e) = signaling.send_binary(chunk.encode()) {
            warn!(slot_id, error = %e, "Upload failed");
            let from = if last {
                TransferState::Uploaded
            } else {
                TransferState::Uploading
            };
            advance(&state, from, TransferState::Failed);
            return;
        }
    }
    debug!(slot_id, chunks = count, "Upload complete");
}

#[derive(Debug, Default)]
struct Slots {
    /// Where the next allocation starts looking
    cursor: u8,
    /// Slots given up locally whose server transfer may still be running
    draining: HashSet<u8>,
}

/// Inbound attachment transfers keyed by slot
#[derive(Debug, Default)]
pub(crate) struct Downloads {
    waiting: PendingRequests<Vec<u8>, Error>,
    chunks: Mutex<Reassembler<u8>>,
    slots: Mutex<Slots>,
}

impl Downloads {
    /// Allocate the next slot, round robin, skipping slots in flight or
    /// still draining
    fn next_slot(&self) -> Option<u8> {
        let mut slots = self.slots();
        for offset in 0..=u8::MAX {
            let slot = slots.cursor.wrapping_add(offset);
            if slots.draining.contains(&slot) || self.waiting.promised(&slot.to_string()) {
                continue;
            }
            slots.cursor = slot.wrapping_add(1);
            return Some(slot);
        }
        None
    }

    fn chunks(&self) -> MutexGuard<'_, Reassembler<u8>> {
        self.chunks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_draining(&self, slot: u8) -> bool {
        self.slots().draining.contains(&slot)
    }

    fn abandon(&self, slot: u8, err: Error) {
        self.chunks().cancel(&slot);
        self.waiting.reject(&slot.to_string(), err);
    }

    /// Give up on a slot we requested. The server is told to stop, and the
    /// slot stays out of use until its transfer is seen to end.
    fn give_up(&self, signaling: &Signaling, slot: u8, err: Error) {
        self.slots().draining.insert(slot);
        self.abandon(slot, err);
        if let Err(e) = signaling.send_binary(AttachmentChunk::cancel(slot).encode()) {
            debug!(slot_id = slot, error = %e, "Could not send cancel frame");
        }
    }

    /// Request an attachment and wait for all of its bytes
    pub async fn fetch(
        &self,
        signaling: &Signaling,
        message_id: &str,
        attachment_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let slot = self
            .next_slot()
            .ok_or_else(|| Error::Rejected("no free attachment slot".into()))?;
        let (tx, rx) = oneshot::channel();
        self.waiting.add(slot.to_string(), move |result| {
            let _ = tx.send(result);
        })?;
        debug!(slot_id = slot, message_id, attachment_id, "Requesting attachment");

        let request = signaling
            .request(
                Operation::GetMessageAttachment,
                json!({ "messageId": message_id, "attachmentId": attachment_id, "slotId": slot }),
            )
            .await;
        if let Err(e) = request {
            self.give_up(signaling, slot, Error::Rejected("request failed".into()));
            return Err(e);
        }

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.give_up(signaling, slot, Error::Timeout(format!("slot {}", slot)));
                    return Err(Error::Timeout(format!("Attachment {} did not arrive", attachment_id)));
                }
            },
            None => rx.await,
        };
        received.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Feed one inbound binary frame
    pub fn handle_frame(&self, bytes: &[u8]) {
        let chunk = match AttachmentChunk::decode(bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "Dropping malformed attachment frame");
                return;
            }
        };
        let slot = chunk.slot_id;
        if self.is_draining(slot) {
            if chunk.last || chunk.command == AttachmentCommand::Cancel {
                self.slots().draining.remove(&slot);
                debug!(slot_id = slot, "Abandoned transfer ended");
            }
            return;
        }
        match chunk.command {
            AttachmentCommand::Data => {
                let complete = self.chunks().push(slot, chunk.payload, chunk.last);
                if let Some(data) = complete {
                    if !self.waiting.resolve(&slot.to_string(), data) {
                        debug!(slot_id = slot, "No download waiting on slot");
                    }
                }
            }
            AttachmentCommand::Cancel => {
                info!(slot_id = slot, "Server cancelled transfer");
                self.abandon(slot, Error::Rejected(format!("transfer on slot {} cancelled", slot)));
            }
        }
    }

    /// Fail every download in flight
    pub fn fail_all(&self) {
        self.slots().draining.clear();
        self.chunks().clear();
        self.waiting.reject_all(|| Error::ConnectionClosed);
    }
}
