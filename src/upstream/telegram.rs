//! Telegram upstream implementation
//!
//! Uses the grammers library to talk to Telegram. One authenticated bot
//! client serves everything: message fetches, archive forwards, and the
//! chunked downloads behind the session pool. Chunk requests go out as raw
//! `upload.getFile` invocations so the 1 MiB chunk contract is explicit.

use crate::config::TelegramConfig;
use crate::db::FileKind;
use crate::error::{Error, Result};
use crate::upstream::pool::{DownloadSession, SessionFactory, SessionPool};
use crate::upstream::{BlobStream, DocumentRef, FileLocator, RemoteFile, Upstream};

use async_trait::async_trait;
use bytes::Bytes;
use grammers_client::types::{Chat, Media, Message};
use grammers_client::{Client, Config as ClientConfig, InitParams, InputMessage};
use grammers_session::{PackedChat, PackedType, Session};
use grammers_tl_types as tl;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marker offset the bot API adds to channel ids.
const CHANNEL_ID_MARKER: i64 = 1_000_000_000_000;

/// Convert a possibly bot-API-style channel id (`-100xxxxxxxxxx`) to the
/// bare id the wire protocol uses. Positive ids pass through.
pub fn bare_channel_id(id: i64) -> i64 {
    if id <= -CHANNEL_ID_MARKER {
        -(id + CHANNEL_ID_MARKER)
    } else {
        id.abs()
    }
}

/// Media class from the upstream mime type; attributes take precedence
/// when present.
pub fn kind_from_mime(mime: Option<&str>) -> FileKind {
    match mime {
        Some(m) if m.starts_with("video/") => FileKind::Video,
        Some(m) if m.starts_with("audio/") => FileKind::Audio,
        _ => FileKind::Document,
    }
}

/// Packed-peer cache filled from the update loop. Private channels only
/// resolve after the bot has seen them once in this process's lifetime.
#[derive(Default)]
struct PeerCache {
    inner: parking_lot::RwLock<HashMap<i64, PackedChat>>,
}

impl PeerCache {
    fn note(&self, chat: &Chat) {
        self.inner.write().insert(chat.id(), chat.pack());
    }

    fn get(&self, bare_id: i64) -> Option<PackedChat> {
        self.inner.read().get(&bare_id).cloned()
    }
}

/// Authenticated, long-lived Telegram handle shared by the HTTP surface
/// and the ingest component.
pub struct TelegramUpstream {
    client: Client,
    pool: SessionPool,
    peers: Arc<PeerCache>,
    connected: AtomicBool,
    config: TelegramConfig,
}

impl TelegramUpstream {
    /// Connect and authenticate. Reuses the on-disk session when present
    /// so the bot does not re-authenticate on every start.
    pub async fn connect(config: TelegramConfig) -> Result<Arc<Self>> {
        cleanup_corrupt_session(&config);

        let session = Session::load_file_or_create(&config.session_file)
            .map_err(|e| Error::Upstream(format!("session file: {}", e)))?;

        let mut params = InitParams::default();
        if let Some(proxy) = &config.proxy_url {
            params.proxy_url = Some(proxy.clone());
        }

        info!("Connecting to Telegram...");
        let client = Client::connect(ClientConfig {
            session,
            api_id: config.api_id,
            api_hash: config.api_hash.clone(),
            params,
        })
        .await
        .map_err(|e| Error::Upstream(format!("connect: {}", e)))?;

        if !client
            .is_authorized()
            .await
            .map_err(map_invocation_error)?
        {
            info!("Session not authorized, signing in as bot");
            client
                .bot_sign_in(&config.bot_token)
                .await
                .map_err(|e| Error::Unauthorized(e.to_string()))?;
        }
        save_session(&client, &config)?;
        info!("Connected to Telegram");

        let factory = Arc::new(GrammersSessionFactory {
            client: client.clone(),
        });

        Ok(Arc::new(TelegramUpstream {
            client,
            pool: SessionPool::new(factory),
            peers: Arc::new(PeerCache::default()),
            connected: AtomicBool::new(true),
            config,
        }))
    }

    /// The raw client, for the ingest update loop.
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Record a chat seen in an update so later fetches can address it.
    pub fn note_chat(&self, chat: &Chat) {
        self.peers.note(chat);
    }

    /// Sessions created by the download pool so far.
    pub fn pool_sessions(&self) -> usize {
        self.pool.sessions_created()
    }

    fn packed_for(&self, channel_id: i64) -> PackedChat {
        let bare = bare_channel_id(channel_id);
        self.peers.get(bare).unwrap_or(PackedChat {
            ty: PackedType::Broadcast,
            id: bare,
            access_hash: Some(0),
        })
    }

    /// Forward a user's message into the archive channel; returns the new
    /// message id there.
    pub async fn forward_to_channel(&self, src_chat: PackedChat, src_msg_id: i64) -> Result<i64> {
        let archive = self.packed_for(self.config.archive_channel_id);
        let forwarded = self
            .client
            .forward_messages(archive, &[src_msg_id as i32], src_chat)
            .await
            .map_err(map_invocation_error)?;

        forwarded
            .into_iter()
            .next()
            .flatten()
            .map(|m| m.id() as i64)
            .ok_or_else(|| Error::Upstream("forward produced no message".into()))
    }

    /// Upload a local file into the archive channel; returns the new
    /// message id.
    pub async fn send_document_to_channel(
        &self,
        path: &std::path::Path,
        caption: &str,
    ) -> Result<i64> {
        let archive = self.packed_for(self.config.archive_channel_id);
        let uploaded = self
            .client
            .upload_file(path)
            .await
            .map_err(|e| Error::Upstream(format!("upload: {}", e)))?;

        let sent = self
            .client
            .send_message(archive, InputMessage::text(caption).document(uploaded))
            .await
            .map_err(map_invocation_error)?;
        Ok(sent.id() as i64)
    }

    /// Send a message to a chat; returns the sent message id.
    pub async fn send(&self, chat: PackedChat, message: InputMessage) -> Result<i64> {
        let sent = self
            .client
            .send_message(chat, message)
            .await
            .map_err(map_invocation_error)?;
        Ok(sent.id() as i64)
    }

    /// Edit a previously sent message.
    pub async fn edit(&self, chat: PackedChat, msg_id: i64, message: InputMessage) -> Result<()> {
        self.client
            .edit_message(chat, msg_id as i32, message)
            .await
            .map_err(map_invocation_error)?;
        Ok(())
    }

    /// Mark the handle disconnected; the HTTP surface starts answering 503.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Close pool entries and persist the session. Deterministic shutdown.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        if let Err(e) = save_session(&self.client, &self.config) {
            warn!("Could not persist session on shutdown: {}", e);
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("Telegram handle closed");
    }
}

#[async_trait]
impl Upstream for TelegramUpstream {
    async fn get_message(&self, channel_id: i64, msg_id: i64) -> Result<RemoteFile> {
        let chat = self.packed_for(channel_id);
        debug!("Fetching message: channel_id={}, msg_id={}", channel_id, msg_id);

        let messages = self
            .client
            .get_messages_by_id(chat, &[msg_id as i32])
            .await
            .map_err(map_invocation_error)?;

        let message = messages
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| Error::not_found(format!("message {}/{}", channel_id, msg_id)))?;

        remote_file_from_message(channel_id, msg_id, &message)
    }

    async fn open_stream(&self, locator: &FileLocator, chunk_offset: u64) -> Result<BlobStream> {
        self.pool.stream_from(locator, chunk_offset).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// File facts extractable from a message's media, enough for the ingest
/// path to validate and index an upload.
#[derive(Debug, Clone)]
pub struct MediaMeta {
    pub unique_id: String,
    pub name: Option<String>,
    pub size: u64,
    pub mime_type: Option<String>,
    pub kind: FileKind,
}

/// Inspect a media payload; `None` when it is not a streamable document.
pub fn media_meta(media: &Media) -> Option<MediaMeta> {
    let document = match media {
        Media::Document(document) => document,
        _ => return None,
    };
    let raw = &document.raw;

    let mut kind = kind_from_mime(Some(raw.mime_type.as_str()));
    let mut name = None;
    for attribute in &raw.attributes {
        match attribute {
            tl::enums::DocumentAttribute::Video(_) => kind = FileKind::Video,
            tl::enums::DocumentAttribute::Audio(_) => kind = FileKind::Audio,
            tl::enums::DocumentAttribute::Filename(f) => name = Some(f.file_name.clone()),
            _ => {}
        }
    }

    Some(MediaMeta {
        unique_id: raw.id.to_string(),
        name,
        size: raw.size.max(0) as u64,
        mime_type: Some(raw.mime_type.clone()),
        kind,
    })
}

/// Build a `RemoteFile` from a fetched message, or `NotFound` when the
/// message has no streamable document payload.
fn remote_file_from_message(channel_id: i64, msg_id: i64, message: &Message) -> Result<RemoteFile> {
    let media = message
        .media()
        .ok_or_else(|| Error::not_found(format!("message {} has no media", msg_id)))?;

    let meta = media_meta(&media)
        .ok_or_else(|| Error::not_found(format!("message {} is not a file", msg_id)))?;

    let document = match &media {
        Media::Document(document) => document,
        _ => unreachable!("media_meta only accepts documents"),
    };
    let raw = &document.raw;

    Ok(RemoteFile {
        channel_id,
        msg_id,
        name: meta.name,
        size: meta.size,
        mime_type: meta.mime_type,
        kind: meta.kind,
        locator: FileLocator {
            dc_id: raw.dc_id,
            size: meta.size,
            document: DocumentRef {
                id: raw.id,
                access_hash: raw.access_hash,
                file_reference: raw.file_reference.clone(),
            },
        },
    })
}

/// Download half of the pool: a cloned client handle pinned to one
/// datacenter, invoking raw `upload.getFile`.
struct GrammersSession {
    client: Client,
    dc_id: i32,
}

#[async_trait]
impl DownloadSession for GrammersSession {
    async fn fetch_chunk(&self, doc: &DocumentRef, offset_bytes: u64, limit: u32) -> Result<Bytes> {
        let request = tl::functions::upload::GetFile {
            precise: true,
            cdn_supported: false,
            location: tl::types::InputDocumentFileLocation {
                id: doc.id,
                access_hash: doc.access_hash,
                file_reference: doc.file_reference.clone(),
                thumb_size: String::new(),
            }
            .into(),
            offset: offset_bytes as i64,
            limit: limit as i32,
        };

        let reply = self
            .client
            .invoke_in_dc(self.dc_id, &request)
            .await
            .map_err(map_invocation_error)?;

        match reply {
            tl::enums::upload::File::File(file) => Ok(Bytes::from(file.bytes)),
            tl::enums::upload::File::CdnRedirect(_) => {
                Err(Error::Upstream("unexpected CDN redirect".into()))
            }
        }
    }
}

struct GrammersSessionFactory {
    client: Client,
}

#[async_trait]
impl SessionFactory for GrammersSessionFactory {
    async fn create(&self, dc_id: i32) -> Result<Arc<dyn DownloadSession>> {
        // cloned from the primary authenticated session; the export/import
        // handshake for a foreign datacenter happens inside the client on
        // first invocation and is paid once per entry
        Ok(Arc::new(GrammersSession {
            client: self.client.clone(),
            dc_id,
        }))
    }
}

/// Remove an empty session file left behind by a crashed run; loading it
/// would fail authentication forever.
fn cleanup_corrupt_session(config: &TelegramConfig) {
    if let Ok(meta) = std::fs::metadata(&config.session_file) {
        if meta.len() == 0 {
            warn!("Corrupt session file detected, removing...");
            let _ = std::fs::remove_file(&config.session_file);
        }
    }
}

/// Persist auth state with owner-only permissions.
fn save_session(client: &Client, config: &TelegramConfig) -> Result<()> {
    client
        .session()
        .save_to_file(&config.session_file)
        .map_err(Error::Io)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(
            &config.session_file,
            std::fs::Permissions::from_mode(0o600),
        );
    }

    Ok(())
}

/// Translate grammers invocation errors into the crate taxonomy.
fn map_invocation_error(e: grammers_client::InvocationError) -> Error {
    use grammers_client::InvocationError;

    match e {
        InvocationError::Rpc(rpc) => {
            let name = rpc.name.as_str();
            if name.starts_with("FLOOD_WAIT") {
                Error::FloodLimited(rpc.value.unwrap_or(5))
            } else if name.starts_with("FILE_REFERENCE") {
                Error::ReferenceExpired
            } else if name == "OFFSET_INVALID" {
                // raw byte offsets passed as chunk offsets land here
                Error::Upstream("offset invalid: offsets must be chunk-aligned".into())
            } else if name.starts_with("AUTH_KEY")
                || name == "SESSION_REVOKED"
                || name == "USER_DEACTIVATED"
            {
                Error::Unauthorized(name.to_string())
            } else {
                Error::Upstream(rpc.to_string())
            }
        }
        other => Error::NetworkTransient(other.to_string()),
    }
}
