//! Per-datacenter session pool
//!
//! Re-authenticating against the upstream costs 10-15 s, so download
//! sessions are created once per datacenter and shared by every concurrent
//! stream for the life of the process. The protocol allows one in-flight
//! file request per session; a per-entry lock serialises chunk fetches, so
//! concurrent streams to the same datacenter interleave at blob
//! granularity.

use crate::error::{Error, Result};
use crate::range::CHUNK;
use crate::upstream::{BlobStream, DocumentRef, FileLocator};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One pre-authenticated download channel to a single datacenter.
#[async_trait]
pub trait DownloadSession: Send + Sync {
    /// Fetch one chunk. `offset_bytes` is always chunk-aligned; the reply
    /// is at most `limit` bytes and shorter only at end of file.
    async fn fetch_chunk(&self, doc: &DocumentRef, offset_bytes: u64, limit: u32) -> Result<Bytes>;

    /// Release the underlying connection.
    async fn close(&self) {}
}

/// Creates download sessions on first use of a datacenter.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, dc_id: i32) -> Result<Arc<dyn DownloadSession>>;
}

struct PoolEntry {
    dc_id: i32,
    session: Arc<dyn DownloadSession>,
    /// Held for the duration of a single chunk fetch
    guard: tokio::sync::Mutex<()>,
}

/// Map from datacenter id to its shared entry. Entries are created lazily
/// and live until shutdown.
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    entries: parking_lot::Mutex<HashMap<i32, Arc<tokio::sync::OnceCell<Arc<PoolEntry>>>>>,
    created: AtomicUsize,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        SessionPool {
            factory,
            entries: parking_lot::Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Number of sessions created so far. One per datacenter, ever.
    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    async fn entry(&self, dc_id: i32) -> Result<Arc<PoolEntry>> {
        // the map lock is short; initialisation happens on the cell so a
        // slow first authentication never blocks other datacenters
        let cell = {
            let mut entries = self.entries.lock();
            entries
                .entry(dc_id)
                .or_insert_with(|| Arc::new(tokio::sync::OnceCell::new()))
                .clone()
        };

        let entry = cell
            .get_or_try_init(|| async {
                info!("Session pool miss for DC {}, creating download session", dc_id);
                let session = self.factory.create(dc_id).await?;
                self.created.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(Arc::new(PoolEntry {
                    dc_id,
                    session,
                    guard: tokio::sync::Mutex::new(()),
                }))
            })
            .await?;

        Ok(entry.clone())
    }

    /// Resolve the locator's datacenter and stream chunks from it,
    /// starting `chunk_offset` whole chunks into the file.
    pub async fn stream_from(
        &self,
        locator: &FileLocator,
        chunk_offset: u64,
    ) -> Result<BlobStream> {
        let entry = self.entry(locator.dc_id).await?;
        debug!(
            "Streaming doc {} via pool entry for DC {}, chunk_offset={}",
            locator.document.id, entry.dc_id, chunk_offset
        );

        let state = StreamState {
            entry,
            doc: locator.document.clone(),
            offset_bytes: chunk_offset * CHUNK,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }

            let fetched = {
                let _serialized = st.entry.guard.lock().await;
                st.entry
                    .session
                    .fetch_chunk(&st.doc, st.offset_bytes, CHUNK as u32)
                    .await
            };

            match fetched {
                Ok(blob) => {
                    st.offset_bytes += CHUNK;
                    if (blob.len() as u64) < CHUNK {
                        st.done = true;
                    }
                    if blob.is_empty() {
                        None
                    } else {
                        Some((Ok(blob), st))
                    }
                }
                Err(e) => {
                    st.done = true;
                    Some((Err(e), st))
                }
            }
        });

        Ok(BlobStream::new(stream))
    }

    /// Close every entry. Called once at process shutdown.
    pub async fn shutdown(&self) {
        let cells: Vec<_> = self.entries.lock().values().cloned().collect();
        for cell in cells {
            if let Some(entry) = cell.get() {
                entry.session.close().await;
                debug!("Closed session-pool entry for DC {}", entry.dc_id);
            }
        }
    }
}

struct StreamState {
    entry: Arc<PoolEntry>,
    doc: DocumentRef,
    offset_bytes: u64,
    done: bool,
}
