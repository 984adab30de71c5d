//! Per-user conversational state
//!
//! Upload and URL flows span several messages; the in-between context
//! lives here, keyed by user id behind a short lock. Entries are garbage
//! collected after ten minutes of inactivity.

use crate::db::FileKind;
use crate::ingest::fetcher::MediaCandidate;

use grammers_session::PackedChat;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default inactivity TTL for pending entries
pub const STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// A file message waiting for the user to pick a display name.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub src_chat: PackedChat,
    pub src_msg_id: i64,
    pub file_unique_id: String,
    pub original_name: Option<String>,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    pub kind: FileKind,
    /// Progress message to keep editing through the flow
    pub prompt_msg_id: i64,
}

/// A probed URL waiting for the user to pick a quality.
#[derive(Debug, Clone)]
pub struct PendingUrl {
    pub chat: PackedChat,
    pub url: String,
    pub media_id: String,
    pub title: String,
    pub duration_secs: u64,
    pub candidates: Vec<MediaCandidate>,
    pub prompt_msg_id: i64,
}

#[derive(Debug, Clone)]
pub enum Pending {
    Upload(PendingUpload),
    Url(PendingUrl),
}

struct Entry {
    pending: Pending,
    touched: Instant,
}

/// `user_id -> Pending` map with TTL-based garbage collection.
pub struct StateMap {
    ttl: Duration,
    inner: parking_lot::Mutex<HashMap<i64, Entry>>,
}

impl StateMap {
    pub fn new(ttl: Duration) -> Self {
        StateMap {
            ttl,
            inner: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Replace whatever the user had pending.
    pub fn put(&self, user_id: i64, pending: Pending) {
        self.inner.lock().insert(
            user_id,
            Entry {
                pending,
                touched: Instant::now(),
            },
        );
    }

    /// Remove and return the user's pending entry.
    pub fn take(&self, user_id: i64) -> Option<Pending> {
        self.inner.lock().remove(&user_id).map(|e| e.pending)
    }

    pub fn has_pending(&self, user_id: i64) -> bool {
        self.inner.lock().contains_key(&user_id)
    }

    /// Drop entries idle longer than the TTL; returns how many went.
    pub fn gc(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, entry| entry.touched.elapsed() < self.ttl);
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for StateMap {
    fn default() -> Self {
        StateMap::new(STATE_TTL)
    }
}
