//! Upstream chat-platform client
//!
//! The rest of the system sees the upstream as a small capability set:
//! fetch a message's file metadata, and stream its payload in fixed 1 MiB
//! chunks starting at a chunk offset. The Telegram implementation lives in
//! `telegram`; the datacenter session pool in `pool`.

mod backoff;
pub mod pool;
pub mod telegram;

pub use backoff::{Backoff, EditThrottle, SELF_HEAL_ATTEMPTS};
pub use telegram::TelegramUpstream;

use crate::db::FileKind;
use crate::error::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

/// Reference to the upstream document behind a message. Enough to build a
/// file location for chunk fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
}

/// Transient per-request handle required to stream a file. May expire
/// minutes after issuance; the only recovery is re-fetching the message.
/// Never persisted.
#[derive(Debug, Clone)]
pub struct FileLocator {
    /// Datacenter holding the payload; selects the session-pool entry
    pub dc_id: i32,
    /// Payload size in bytes as reported by the upstream
    pub size: u64,
    pub document: DocumentRef,
}

/// File metadata for a fetched archive-channel message.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub channel_id: i64,
    pub msg_id: i64,
    pub name: Option<String>,
    pub size: u64,
    pub mime_type: Option<String>,
    pub kind: FileKind,
    pub locator: FileLocator,
}

/// Lazy, finite sequence of payload blobs, each at most 1 MiB, delivered
/// strictly in order. Dropping it cancels the underlying fetch.
pub struct BlobStream {
    inner: BoxStream<'static, Result<Bytes>>,
}

impl BlobStream {
    pub fn new(stream: impl futures::Stream<Item = Result<Bytes>> + Send + 'static) -> Self {
        BlobStream {
            inner: stream.boxed(),
        }
    }

    /// Next blob, `Ok(None)` at end of sequence. A returned error ends the
    /// sequence; callers must not poll past it.
    pub async fn next_blob(&mut self) -> Result<Option<Bytes>> {
        self.inner.next().await.transpose()
    }
}

/// Capability set the streaming path needs from the chat platform.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch an archive-channel message carrying a file. `NotFound` when
    /// the message is missing or has no streamable payload.
    async fn get_message(&self, channel_id: i64, msg_id: i64) -> Result<RemoteFile>;

    /// Begin streaming at `chunk_offset` whole chunks into the file.
    async fn open_stream(&self, locator: &FileLocator, chunk_offset: u64) -> Result<BlobStream>;

    /// False until the client has authenticated; the HTTP surface answers
    /// 503 while this is false.
    fn is_connected(&self) -> bool;
}

impl Error {
    /// Convenience used across the upstream modules.
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted in-memory upstream for engine and server tests.

    use super::*;
    use crate::range::CHUNK;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// What one `open_stream` call should do.
    #[derive(Debug, Clone)]
    pub enum StreamScript {
        /// Serve blobs to the end of the file
        Clean,
        /// Serve `blobs` blobs, then fail with the given error kind
        FailAfterBlobs(usize, FaultKind),
        /// Serve exactly this many bytes (last blob truncated), then fail
        FailAfterBytes(u64, FaultKind),
        /// End the sequence early without an error after `blobs` blobs
        EndAfterBlobs(usize),
        /// Serve `blobs` blobs, then hang until cancelled or timed out
        StallAfterBlobs(usize),
    }

    #[derive(Debug, Clone, Copy)]
    pub enum FaultKind {
        ReferenceExpired,
        NetworkTransient,
    }

    impl FaultKind {
        fn to_error(self) -> Error {
            match self {
                FaultKind::ReferenceExpired => Error::ReferenceExpired,
                FaultKind::NetworkTransient => Error::NetworkTransient("injected".into()),
            }
        }
    }

    struct FakeFile {
        data: Arc<Vec<u8>>,
        name: Option<String>,
        mime: Option<String>,
        kind: FileKind,
        scripts: VecDeque<StreamScript>,
    }

    /// In-memory upstream keyed by `(channel_id, msg_id)`.
    #[derive(Default)]
    pub struct FakeUpstream {
        files: Mutex<HashMap<(i64, i64), FakeFile>>,
        connected: std::sync::atomic::AtomicBool,
        generation: AtomicUsize,
        pub get_message_calls: AtomicUsize,
        pub open_stream_calls: AtomicUsize,
        pub blobs_served: Arc<AtomicUsize>,
    }

    impl FakeUpstream {
        pub fn new() -> Self {
            let fake = FakeUpstream::default();
            fake.connected.store(true, Ordering::SeqCst);
            fake
        }

        pub fn disconnected() -> Self {
            FakeUpstream::default()
        }

        pub fn add_file(&self, channel_id: i64, msg_id: i64, data: Vec<u8>) {
            self.files.lock().insert(
                (channel_id, msg_id),
                FakeFile {
                    data: Arc::new(data),
                    name: Some(format!("file_{}.mp4", msg_id)),
                    mime: Some("video/mp4".to_string()),
                    kind: FileKind::Video,
                    scripts: VecDeque::new(),
                },
            );
        }

        /// Queue a script for the next `open_stream` on this file; once the
        /// queue drains, streams are clean.
        pub fn push_script(&self, channel_id: i64, msg_id: i64, script: StreamScript) {
            let mut files = self.files.lock();
            files
                .get_mut(&(channel_id, msg_id))
                .expect("unknown fake file")
                .scripts
                .push_back(script);
        }

    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn get_message(&self, channel_id: i64, msg_id: i64) -> Result<RemoteFile> {
            self.get_message_calls.fetch_add(1, Ordering::SeqCst);
            let files = self.files.lock();
            let file = files
                .get(&(channel_id, msg_id))
                .ok_or_else(|| Error::not_found(format!("message {}", msg_id)))?;

            // every fetch hands out a fresh "reference"
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) as i64;

            Ok(RemoteFile {
                channel_id,
                msg_id,
                name: file.name.clone(),
                size: file.data.len() as u64,
                mime_type: file.mime.clone(),
                kind: file.kind,
                locator: FileLocator {
                    dc_id: 2,
                    size: file.data.len() as u64,
                    document: DocumentRef {
                        id: msg_id,
                        access_hash: generation,
                        file_reference: vec![generation as u8],
                    },
                },
            })
        }

        async fn open_stream(
            &self,
            locator: &FileLocator,
            chunk_offset: u64,
        ) -> Result<BlobStream> {
            self.open_stream_calls.fetch_add(1, Ordering::SeqCst);

            let (data, script) = {
                let mut files = self.files.lock();
                let file = files
                    .iter_mut()
                    .find(|((_, msg_id), _)| *msg_id == locator.document.id)
                    .map(|(_, f)| f)
                    .ok_or_else(|| Error::not_found("locator"))?;
                let script = file.scripts.pop_front().unwrap_or(StreamScript::Clean);
                (file.data.clone(), script)
            };

            let mut blobs: Vec<Result<Bytes>> = data
                .chunks(CHUNK as usize)
                .skip(chunk_offset as usize)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();

            let mut stall = false;
            match script {
                StreamScript::Clean => {}
                StreamScript::FailAfterBlobs(n, fault) => {
                    blobs.truncate(n);
                    blobs.push(Err(fault.to_error()));
                }
                StreamScript::FailAfterBytes(limit, fault) => {
                    let mut kept: Vec<Result<Bytes>> = Vec::new();
                    let mut emitted = 0u64;
                    for blob in blobs {
                        let blob = blob.expect("scripted blobs are data");
                        if emitted + blob.len() as u64 >= limit {
                            let keep = (limit - emitted) as usize;
                            if keep > 0 {
                                kept.push(Ok(blob.slice(..keep)));
                            }
                            break;
                        }
                        emitted += blob.len() as u64;
                        kept.push(Ok(blob));
                    }
                    kept.push(Err(fault.to_error()));
                    blobs = kept;
                }
                StreamScript::EndAfterBlobs(n) => blobs.truncate(n),
                StreamScript::StallAfterBlobs(n) => {
                    blobs.truncate(n);
                    stall = true;
                }
            }

            let served = self.blobs_served.clone();
            let stream = futures::stream::iter(blobs).inspect(move |_| {
                served.fetch_add(1, Ordering::SeqCst);
            });
            if stall {
                Ok(BlobStream::new(stream.chain(futures::stream::pending())))
            } else {
                Ok(BlobStream::new(stream))
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    /// Deterministic test payload where each byte encodes its offset.
    pub fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_fake_serves_whole_file_in_chunks() {
        let fake = FakeUpstream::new();
        let data = patterned(CHUNK as usize + 123);
        fake.add_file(-100, 1, data.clone());

        let file = fake.get_message(-100, 1).await.unwrap();
        let mut stream = fake.open_stream(&file.locator, 0).await.unwrap();

        let mut collected = Vec::new();
        while let Some(blob) = stream.next_blob().await.unwrap() {
            assert!(blob.len() as u64 <= CHUNK);
            collected.extend_from_slice(&blob);
        }
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn test_fake_skips_chunks_and_injects_faults() {
        let fake = FakeUpstream::new();
        let data = patterned(3 * CHUNK as usize);
        fake.add_file(-100, 2, data.clone());
        fake.push_script(-100, 2, StreamScript::FailAfterBlobs(1, FaultKind::ReferenceExpired));

        let file = fake.get_message(-100, 2).await.unwrap();
        let mut stream = fake.open_stream(&file.locator, 1).await.unwrap();

        let first = stream.next_blob().await.unwrap().unwrap();
        assert_eq!(&first[..], &data[CHUNK as usize..2 * CHUNK as usize]);
        assert!(matches!(
            stream.next_blob().await,
            Err(Error::ReferenceExpired)
        ));

        // script consumed; a fresh stream is clean
        let mut stream = fake.open_stream(&file.locator, 1).await.unwrap();
        assert!(stream.next_blob().await.unwrap().is_some());
    }
}
