//! Byte-range streaming engine
//!
//! Bridges an HTTP client expecting arbitrary byte offsets to an upstream
//! that speaks in fixed 1 MiB chunks. Given a file and a validated range,
//! the engine delivers exactly `want` bytes: it trims the head of the
//! first chunk, truncates the tail, and when a file reference expires
//! mid-stream it re-fetches the message and resumes at the current byte
//! cursor. Recovery is bounded and backed off; the retry state lives in
//! this outer loop, never inside an upstream iterator.

use crate::error::{Error, Result};
use crate::range::{ByteRange, ChunkPlan};
use crate::upstream::{Backoff, RemoteFile, Upstream, SELF_HEAL_ATTEMPTS};

use bytes::Bytes;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Blobs buffered between the upstream pull and the HTTP write. Small so
/// a disconnected client stops the pull within one blob's latency.
const BODY_CHANNEL_CAPACITY: usize = 4;

/// Byte stream handed to the HTTP response body. Dropping it cancels the
/// upstream fetch.
pub struct BodyStream {
    rx: mpsc::Receiver<Result<Bytes>>,
}

impl futures::Stream for BodyStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// The streaming core shared by all requests.
pub struct StreamEngine {
    upstream: Arc<dyn Upstream>,
    blob_timeout: Duration,
}

impl StreamEngine {
    pub fn new(upstream: Arc<dyn Upstream>, blob_timeout: Duration) -> Self {
        StreamEngine {
            upstream,
            blob_timeout,
        }
    }

    /// Start streaming `range` of `file`. The pump runs as its own task;
    /// bytes arrive through the returned stream in strict offset order.
    pub fn open(&self, file: RemoteFile, range: ByteRange) -> BodyStream {
        let plan = range.plan();
        info!(
            "Stream start: msg_id={}, range={}-{}/{}, chunk_offset={}, head_skip={}, want={}",
            file.msg_id, range.start, range.end, file.size,
            plan.chunk_offset, plan.head_skip, plan.want
        );

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let upstream = self.upstream.clone();
        let blob_timeout = self.blob_timeout;
        tokio::spawn(pump(upstream, file, range, blob_timeout, tx));

        BodyStream { rx }
    }
}

enum Attempt {
    Complete,
    ClientGone,
    Failed(Error),
}

/// Outer self-heal loop. Owns `(delivered, plan)`; every retry recomputes
/// the plan from the absolute byte cursor and builds a new blob stream.
async fn pump(
    upstream: Arc<dyn Upstream>,
    mut file: RemoteFile,
    range: ByteRange,
    blob_timeout: Duration,
    tx: mpsc::Sender<Result<Bytes>>,
) {
    let want = range.want();
    let mut delivered: u64 = 0;
    let mut backoff = Backoff::self_heal();

    loop {
        let plan = ChunkPlan::at_position(range.start + delivered, want - delivered);
        debug!(
            "Pulling: msg_id={}, chunk_offset={}, head_skip={}, remaining={}",
            file.msg_id, plan.chunk_offset, plan.head_skip, plan.want
        );

        let failure = match run_attempt(
            &upstream,
            &file,
            &plan,
            blob_timeout,
            &tx,
            &mut delivered,
            want,
        )
        .await
        {
            Attempt::Complete => {
                info!("Stream complete: msg_id={}, delivered={}", file.msg_id, delivered);
                return;
            }
            Attempt::ClientGone => {
                debug!(
                    "Client disconnected: msg_id={}, delivered={}/{}",
                    file.msg_id, delivered, want
                );
                return;
            }
            Attempt::Failed(e) => e,
        };

        // flood waits sleep what the limiter asked for and do not consume
        // the self-heal budget
        if let Error::FloodLimited(secs) = failure {
            warn!("Flood limited, sleeping {}s before resuming", secs);
            tokio::time::sleep(Duration::from_secs(secs as u64)).await;
            continue;
        }

        if !failure.is_recoverable() {
            if let Error::PrematureEof { remaining } = &failure {
                error!(
                    "Upstream sequence ended early: msg_id={}, {} of {} bytes undelivered",
                    file.msg_id, remaining, want
                );
            }
            let _ = tx.send(Err(failure)).await;
            return;
        }

        let Some(delay) = backoff.next_delay() else {
            error!(
                "Stream broken: msg_id={}, self-heal budget exhausted at byte {}",
                file.msg_id,
                range.start + delivered
            );
            let _ = tx
                .send(Err(Error::StreamBroken {
                    attempts: SELF_HEAL_ATTEMPTS,
                }))
                .await;
            return;
        };
        warn!(
            "Stream fault ({}) at byte {}, retry {} in {:?}",
            failure,
            range.start + delivered,
            backoff.attempts_used(),
            delay
        );
        tokio::time::sleep(delay).await;

        // a blob timeout keeps the current locator on its first retry; all
        // other recoveries re-resolve it from the archive channel
        let keep_locator =
            matches!(failure, Error::BlobTimeout) && backoff.attempts_used() == 1;
        if !keep_locator {
            match upstream.get_message(file.channel_id, file.msg_id).await {
                Ok(fresh) => file = fresh,
                Err(e) => {
                    error!("Locator refresh failed: msg_id={}: {}", file.msg_id, e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }
}

/// One pass over a fresh blob stream. Head skip applies only to the first
/// blob; the tail blob is truncated so no blob is emitted past `want`.
async fn run_attempt(
    upstream: &Arc<dyn Upstream>,
    file: &RemoteFile,
    plan: &ChunkPlan,
    blob_timeout: Duration,
    tx: &mpsc::Sender<Result<Bytes>>,
    delivered: &mut u64,
    want: u64,
) -> Attempt {
    if *delivered == want {
        return Attempt::Complete;
    }

    let mut blobs = match upstream.open_stream(&file.locator, plan.chunk_offset).await {
        Ok(blobs) => blobs,
        Err(e) => return Attempt::Failed(e),
    };
    let mut head_skip = plan.head_skip;

    loop {
        let next = match tokio::time::timeout(blob_timeout, blobs.next_blob()).await {
            Err(_) => return Attempt::Failed(Error::BlobTimeout),
            Ok(Err(e)) => return Attempt::Failed(e),
            Ok(Ok(next)) => next,
        };
        let Some(mut blob) = next else {
            return Attempt::Failed(Error::PrematureEof {
                remaining: want - *delivered,
            });
        };

        if head_skip > 0 {
            if (blob.len() as u64) <= head_skip {
                head_skip -= blob.len() as u64;
                continue;
            }
            blob = blob.slice(head_skip as usize..);
            head_skip = 0;
        }

        let remaining = want - *delivered;
        if (blob.len() as u64) > remaining {
            blob = blob.slice(..remaining as usize);
        }

        *delivered += blob.len() as u64;
        if tx.send(Ok(blob)).await.is_err() {
            return Attempt::ClientGone;
        }
        if *delivered == want {
            return Attempt::Complete;
        }
    }
}
