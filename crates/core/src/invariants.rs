//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible room states during development.
//! These checks are compiled out in release builds.

use crate::models::{RoomInfo, RoomState};

/// Whether a room may move from `from` to `to`
pub fn is_valid_transition(from: RoomState, to: RoomState) -> bool {
    use RoomState::*;
    match (from, to) {
        (Disposed, _) => false,
        (_, Disposed) => true,
        (New, Pending) | (Failed, Pending) => true,
        (Pending, Joined) | (Pending, Failed) => true,
        (Joined, Failed) => true,
        (a, b) => a == b,
    }
}

/// Validate that a room snapshot is internally consistent
pub fn assert_room_invariants(room: &RoomInfo) {
    debug_assert!(!room.room_id.is_empty(), "Room has empty id");

    // The server only reports our user id once membership is confirmed
    debug_assert!(
        room.local_user_id.is_none() || room.state != RoomState::New,
        "Room {} knows the local user id before any join attempt",
        room.room_id
    );
}

/// Validate that a freshly minted tid replaces the tracked one
pub fn assert_fresh_tid(previous: Option<&str>, minted: &str) {
    debug_assert!(!minted.is_empty(), "Minted empty tid");
    debug_assert!(
        previous != Some(minted),
        "Minted tid {} equals the tracked tid",
        minted
    );
}
