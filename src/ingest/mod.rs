//! Ingest and indexing
//!
//! Drives the bot side of the system: direct uploads and short-video URLs
//! come in over private chats, land in the archive channel, and get
//! recorded in the metadata index that the streaming path reads. Also
//! answers the catalog/search/delete commands.

mod fetcher;
mod state;

pub use fetcher::{is_media_url, Fetcher, MediaCandidate, ProbeResult};
pub use state::{Pending, PendingUpload, PendingUrl, StateMap};

use crate::config::Config;
use crate::db::{ArchivedFile, FileKind, FileRepo, FileSource};
use crate::error::{Error, Result};
use crate::upstream::telegram::media_meta;
use crate::upstream::{EditThrottle, TelegramUpstream};
use crate::util::format_size;

use chrono::Utc;
use grammers_client::types::{CallbackQuery, Chat, Media, Message};
use grammers_client::{button, reply_markup, InputMessage, Update};
use grammers_session::PackedChat;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Give up on the update loop after this many consecutive failures.
const MAX_UPDATE_ERRORS: u32 = 5;

/// Attempts for archive writes interrupted by flood waits.
const FLOOD_RETRIES: u32 = 3;

pub struct Ingest {
    upstream: Arc<TelegramUpstream>,
    repo: Arc<dyn FileRepo>,
    config: Config,
    states: StateMap,
    fetcher: Fetcher,
}

impl Ingest {
    pub fn new(upstream: Arc<TelegramUpstream>, repo: Arc<dyn FileRepo>, config: Config) -> Arc<Self> {
        let fetcher = Fetcher::new(
            config.telegram.proxy_url.clone(),
            config.ingest.cookies.clone(),
            config.max_file_size_bytes(),
            config.max_duration_secs(),
        );
        Arc::new(Ingest {
            upstream,
            repo,
            config,
            states: StateMap::default(),
            fetcher,
        })
    }

    /// Consume updates until shutdown. Every update also feeds the peer
    /// cache, which is how private archive channels become addressable.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let client = self.upstream.client().clone();
        info!("Ingest loop started");
        let mut consecutive_errors = 0u32;

        loop {
            match client.next_update().await {
                Ok(Update::NewMessage(message)) => {
                    consecutive_errors = 0;
                    self.upstream.note_chat(&message.chat());
                    if message.outgoing() {
                        continue;
                    }
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_message(message).await {
                            warn!("Message handling failed: {}", e);
                        }
                    });
                }
                Ok(Update::CallbackQuery(query)) => {
                    consecutive_errors = 0;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_callback(query).await {
                            warn!("Callback handling failed: {}", e);
                        }
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_UPDATE_ERRORS {
                        error!("Update loop failing repeatedly, giving up: {}", e);
                        self.upstream.mark_disconnected();
                        return Err(Error::Upstream(e.to_string()));
                    }
                    warn!("Update loop error ({}/{}): {}", consecutive_errors, MAX_UPDATE_ERRORS, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }

            self.states.gc();
        }
    }

    async fn handle_message(&self, message: Message) -> Result<()> {
        // conversations happen in private chats only; channel and group
        // traffic matters just for the peer cache
        let Chat::User(_) = message.chat() else {
            return Ok(());
        };
        let user_id = message.chat().id();
        let chat = message.chat().pack();

        if let Some(media) = message.media() {
            return self.handle_file_upload(user_id, chat, &message, &media).await;
        }

        let text = message.text().trim().to_string();
        if let Some(command) = text.strip_prefix('/') {
            return self.handle_command(user_id, chat, command).await;
        }

        if self.states.has_pending(user_id) {
            return self.handle_pending_reply(user_id, chat, &text).await;
        }

        if is_media_url(&text) {
            return self.handle_url(user_id, chat, text).await;
        }

        self.reply(chat, "Send me a file or a YouTube link to get started. /help for details.")
            .await?;
        Ok(())
    }

    async fn handle_command(&self, user_id: i64, chat: PackedChat, command: &str) -> Result<()> {
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };

        match name {
            "start" => {
                self.repo.record_user(user_id).await.ok();
                self.reply(chat, &self.start_text()).await?;
            }
            "help" => {
                self.reply(chat, &self.help_text()).await?;
            }
            "catalog" => self.send_catalog(user_id, chat).await?,
            "search" => self.send_search(user_id, chat, arg).await?,
            "delete" => self.confirm_delete(user_id, chat, arg).await?,
            _ if name.starts_with("confirm_delete_") => {
                let msg_id = name.trim_start_matches("confirm_delete_");
                self.perform_delete(chat, msg_id).await?;
            }
            _ => {
                self.reply(chat, "Unknown command. /help lists what I can do.")
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_file_upload(
        &self,
        user_id: i64,
        chat: PackedChat,
        message: &Message,
        media: &Media,
    ) -> Result<()> {
        let Some(meta) = media_meta(media) else {
            self.reply(chat, "That message has no file I can archive.").await?;
            return Ok(());
        };

        info!(
            "File upload received: user={}, size={}, kind={:?}",
            user_id, meta.size, meta.kind
        );

        if meta.size > self.config.max_file_size_bytes() {
            warn!("File rejected (too large): {} bytes, user={}", meta.size, user_id);
            self.reply(
                chat,
                &format!(
                    "File too large: {}. Maximum size: {} (prevents upload timeouts).",
                    format_size(meta.size),
                    format_size(self.config.max_file_size_bytes())
                ),
            )
            .await?;
            return Ok(());
        }

        let prompt = format!(
            "File received: {} ({}).\nSend a display name for it, or `skip` to keep the original.",
            meta.name.as_deref().unwrap_or("unnamed"),
            format_size(meta.size)
        );
        let prompt_msg_id = self.reply(chat, &prompt).await?;

        self.states.put(
            user_id,
            Pending::Upload(PendingUpload {
                src_chat: chat,
                src_msg_id: message.id() as i64,
                file_unique_id: meta.unique_id,
                original_name: meta.name,
                size_bytes: meta.size,
                mime_type: meta.mime_type,
                kind: meta.kind,
                prompt_msg_id,
            }),
        );
        Ok(())
    }

    async fn handle_pending_reply(&self, user_id: i64, chat: PackedChat, text: &str) -> Result<()> {
        match self.states.take(user_id) {
            Some(Pending::Upload(pending)) => {
                let name = match resolve_display_name(text, pending.original_name.as_deref()) {
                    Ok(name) => name,
                    Err(_) => {
                        self.states.put(user_id, Pending::Upload(pending));
                        self.reply(chat, "That name is empty. Send a valid name or `skip`.")
                            .await?;
                        return Ok(());
                    }
                };
                self.finish_upload(user_id, chat, pending, name).await
            }
            Some(Pending::Url(pending)) => {
                // quality selection happens on the keyboard, but accept a
                // typed label too
                let choice = text.trim().to_lowercase();
                match pending
                    .candidates
                    .iter()
                    .find(|c| c.quality_label.to_lowercase() == choice)
                    .cloned()
                {
                    Some(candidate) => {
                        self.finish_url_download(user_id, pending, candidate).await
                    }
                    None => {
                        self.states.put(user_id, Pending::Url(pending));
                        self.reply(chat, "Pick one of the offered qualities.").await?;
                        Ok(())
                    }
                }
            }
            None => Ok(()),
        }
    }

    async fn finish_upload(
        &self,
        user_id: i64,
        chat: PackedChat,
        pending: PendingUpload,
        display_name: String,
    ) -> Result<()> {
        self.edit(chat, pending.prompt_msg_id, "Processing... forwarding to archive.")
            .await
            .ok();

        let forwarded = {
            let upstream = self.upstream.clone();
            let src_chat = pending.src_chat;
            let src_msg_id = pending.src_msg_id;
            with_flood_retry(move || {
                let upstream = upstream.clone();
                async move { upstream.forward_to_channel(src_chat, src_msg_id).await }
            })
            .await
        };

        let msg_id = match forwarded {
            Ok(id) => id,
            Err(e) => {
                error!("Forward to archive failed for user {}: {}", user_id, e);
                self.edit(
                    chat,
                    pending.prompt_msg_id,
                    "Upload failed: could not forward to the archive. Try again later.",
                )
                .await
                .ok();
                return Err(e);
            }
        };

        let record = build_archived_file(
            &self.config,
            msg_id,
            pending.file_unique_id,
            display_name.clone(),
            pending.size_bytes,
            pending.mime_type,
            pending.kind,
            None,
            None,
            FileSource::DirectUpload,
            None,
            user_id,
        );

        if let Err(e) = self.repo.put_file(&record).await {
            // forwarded but not indexed: no stream URL for the user
            error!("Indexing failed after forward: msg_id={}: {}", msg_id, e);
            self.edit(
                chat,
                pending.prompt_msg_id,
                "Database error: the file reached the archive but could not be indexed. Contact support.",
            )
            .await
            .ok();
            return Err(e);
        }

        self.edit(
            chat,
            pending.prompt_msg_id,
            &format!(
                "File indexed.\nName: {}\nSize: {}\nStream link: {}",
                display_name,
                format_size(pending.size_bytes),
                record.stream_link
            ),
        )
        .await?;
        Ok(())
    }

    async fn handle_url(&self, user_id: i64, chat: PackedChat, url: String) -> Result<()> {
        let prompt_msg_id = self.reply(chat, "Link received. Probing available qualities...").await?;

        let probe = match self.fetcher.probe(&url).await {
            Ok(probe) => probe,
            Err(e) => {
                self.edit(chat, prompt_msg_id, &e.to_string()).await.ok();
                return Ok(());
            }
        };

        let pending = PendingUrl {
            chat,
            url,
            media_id: probe.media_id,
            title: probe.title.clone(),
            duration_secs: probe.duration_secs,
            candidates: probe.candidates.clone(),
            prompt_msg_id,
        };

        if let [only] = pending.candidates.as_slice() {
            let candidate = only.clone();
            return self.finish_url_download(user_id, pending, candidate).await;
        }

        let rows: Vec<Vec<_>> = pending
            .candidates
            .chunks(3)
            .map(|row| {
                row.iter()
                    .map(|c| button::inline(c.quality_label.clone(), format!("q:{}", c.format_id)))
                    .collect()
            })
            .collect();

        self.upstream
            .edit(
                chat,
                prompt_msg_id,
                InputMessage::text(format!("{}\nPick a quality:", probe.title))
                    .reply_markup(&reply_markup::inline(rows)),
            )
            .await?;

        self.states.put(user_id, Pending::Url(pending));
        Ok(())
    }

    async fn handle_callback(&self, query: CallbackQuery) -> Result<()> {
        let user_id = query.sender().id();
        let data = String::from_utf8_lossy(query.data()).to_string();
        query.answer().send().await.ok();

        let Some(format_id) = data.strip_prefix("q:") else {
            return Ok(());
        };

        let Some(Pending::Url(pending)) = self.states.take(user_id) else {
            return Ok(());
        };
        let Some(candidate) = pending
            .candidates
            .iter()
            .find(|c| c.format_id == format_id)
            .cloned()
        else {
            return Ok(());
        };

        self.finish_url_download(user_id, pending, candidate).await
    }

    async fn finish_url_download(
        &self,
        user_id: i64,
        pending: PendingUrl,
        candidate: MediaCandidate,
    ) -> Result<()> {
        let chat = pending.chat;
        let prompt = pending.prompt_msg_id;
        info!(
            "URL download: user={}, quality={}, title={}",
            user_id, candidate.quality_label, pending.title
        );

        self.edit(chat, prompt, &format!("Downloading {} ({})...", pending.title, candidate.quality_label))
            .await
            .ok();

        // progress edits come from a side task, at most one per second
        let progress_bytes = Arc::new(AtomicU64::new(0));
        let progress_done = Arc::new(tokio::sync::Notify::new());
        {
            let upstream = self.upstream.clone();
            let bytes = progress_bytes.clone();
            let done = progress_done.clone();
            let title = pending.title.clone();
            let throttle = EditThrottle::default();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = done.notified() => break,
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {
                            let seen = bytes.load(Ordering::Relaxed);
                            if seen > 0 && throttle.permit() {
                                let text = format!("Downloading {}... {}", title, format_size(seen));
                                let _ = upstream.edit(chat, prompt, InputMessage::text(text)).await;
                            }
                        }
                    }
                }
            });
        }

        let downloaded = {
            let bytes = progress_bytes.clone();
            self.fetcher
                .download(&pending.url, &candidate.format_id, move |b| {
                    bytes.store(b, Ordering::Relaxed)
                })
                .await
        };
        progress_done.notify_waiters();

        let download = match downloaded {
            Ok(download) => download,
            Err(e) => {
                self.edit(chat, prompt, &e.to_string()).await.ok();
                return Ok(());
            }
        };

        self.edit(chat, prompt, "Download complete. Uploading to archive...")
            .await
            .ok();

        let caption = format!("{} ({})", pending.title, candidate.quality_label);
        let sent = {
            let upstream = self.upstream.clone();
            let path = download.path.clone();
            let caption = caption.clone();
            with_flood_retry(move || {
                let upstream = upstream.clone();
                let path = path.clone();
                let caption = caption.clone();
                async move { upstream.send_document_to_channel(&path, &caption).await }
            })
            .await
        };

        let msg_id = match sent {
            Ok(id) => id,
            Err(e) => {
                error!("Archive upload failed for user {}: {}", user_id, e);
                self.edit(chat, prompt, "Upload failed: could not reach the archive. Try again later.")
                    .await
                    .ok();
                return Err(e);
            }
        };

        let record = build_archived_file(
            &self.config,
            msg_id,
            pending.media_id,
            pending.title.clone(),
            download.size_bytes,
            Some(guess_mime(&candidate.ext)),
            FileKind::Video,
            Some(pending.duration_secs as i64),
            Some(candidate.quality_label.clone()),
            FileSource::ExternalUrl,
            Some(pending.url.clone()),
            user_id,
        );

        if let Err(e) = self.repo.put_file(&record).await {
            error!("Indexing failed after upload: msg_id={}: {}", msg_id, e);
            self.edit(
                chat,
                prompt,
                "Database error: the video reached the archive but could not be indexed. Contact support.",
            )
            .await
            .ok();
            return Err(e);
        }

        self.edit(
            chat,
            prompt,
            &format!(
                "Upload complete.\nName: {}\nSize: {}\nDuration: {}m\nStream link: {}",
                pending.title,
                format_size(download.size_bytes),
                pending.duration_secs / 60,
                record.stream_link
            ),
        )
        .await?;
        // download drops here; the scratch directory goes with it
        Ok(())
    }

    async fn send_catalog(&self, user_id: i64, chat: PackedChat) -> Result<()> {
        let files = self.repo.list_by_user(user_id, 0, 50).await?;
        if files.is_empty() {
            self.reply(chat, "Your archive is empty. Send a file or a link to get started.")
                .await?;
            return Ok(());
        }

        let mut text = format!("Your archive ({} files):\n", files.len());
        for (i, file) in files.iter().enumerate() {
            text.push_str(&format!(
                "{}. {} ({})\n   {}\n",
                i + 1,
                file.display_name,
                format_size(file.size_bytes.max(0) as u64),
                file.stream_link
            ));
        }
        self.reply(chat, &text).await?;
        Ok(())
    }

    async fn send_search(&self, user_id: i64, chat: PackedChat, query: &str) -> Result<()> {
        if query.is_empty() {
            self.reply(chat, "Usage: /search <name>").await?;
            return Ok(());
        }

        let files = self.repo.search(user_id, query).await?;
        if files.is_empty() {
            self.reply(chat, &format!("No files match \"{}\".", query)).await?;
            return Ok(());
        }

        let mut text = format!("Matches for \"{}\":\n", query);
        for file in &files {
            text.push_str(&format!("- {} -> {}\n", file.display_name, file.stream_link));
        }
        self.reply(chat, &text).await?;
        Ok(())
    }

    async fn confirm_delete(&self, _user_id: i64, chat: PackedChat, arg: &str) -> Result<()> {
        let Ok(msg_id) = arg.parse::<i64>() else {
            self.reply(chat, "Usage: /delete <message_id> (ids are in /catalog)").await?;
            return Ok(());
        };

        match self
            .repo
            .get_by_msg_id(self.config.telegram.archive_channel_id, msg_id)
            .await?
        {
            Some(file) if file.is_active => {
                self.reply(
                    chat,
                    &format!(
                        "Delete \"{}\"? The stream link stops working.\nReply /confirm_delete_{} to proceed.",
                        file.display_name, msg_id
                    ),
                )
                .await?;
            }
            _ => {
                self.reply(chat, &format!("No file with id {}.", msg_id)).await?;
            }
        }
        Ok(())
    }

    async fn perform_delete(&self, chat: PackedChat, arg: &str) -> Result<()> {
        let Ok(msg_id) = arg.parse::<i64>() else {
            self.reply(chat, "Invalid delete confirmation.").await?;
            return Ok(());
        };

        if self.repo.soft_delete(msg_id).await? {
            self.reply(chat, &format!("File {} deleted.", msg_id)).await?;
        } else {
            self.reply(chat, &format!("No file with id {}.", msg_id)).await?;
        }
        Ok(())
    }

    fn start_text(&self) -> String {
        format!(
            "Welcome to StreamVault.\n\
             Send any file and I index it for streaming.\n\
             Send a YouTube link and I download and archive it.\n\
             /catalog lists your files, /help explains the rest.\n\
             Limits: {} per file, {} hours per video.",
            format_size(self.config.max_file_size_bytes()),
            self.config.ingest.max_duration_hours
        )
    }

    fn help_text(&self) -> String {
        format!(
            "Commands:\n\
             /catalog - list your indexed files\n\
             /search <name> - find files by name\n\
             /delete <id> - remove a file from the catalog\n\n\
             Stream links look like {}/stream/<channel>/<id> and support\n\
             seeking in browsers and media players.\n\
             Limits: {} per file, {} hours per video.",
            self.config.server.public_url,
            format_size(self.config.max_file_size_bytes()),
            self.config.ingest.max_duration_hours
        )
    }

    async fn reply(&self, chat: PackedChat, text: &str) -> Result<i64> {
        self.upstream.send(chat, InputMessage::text(text)).await
    }

    async fn edit(&self, chat: PackedChat, msg_id: i64, text: &str) -> Result<()> {
        self.upstream.edit(chat, msg_id, InputMessage::text(text)).await
    }
}

/// Retry archive writes through flood waits, sleeping what the limiter
/// asked plus a safety margin.
async fn with_flood_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for _ in 0..FLOOD_RETRIES {
        match op().await {
            Err(Error::FloodLimited(secs)) => {
                warn!("Flood wait during archive write: {}s", secs);
                tokio::time::sleep(Duration::from_secs(secs as u64 + 5)).await;
            }
            other => return other,
        }
    }
    op().await
}

/// Resolve the display name from the user's reply; `skip` keeps the
/// original file name.
fn resolve_display_name(reply: &str, original: Option<&str>) -> Result<String> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(Error::Ingest("empty name".to_string()));
    }
    if trimmed.eq_ignore_ascii_case("skip") {
        return Ok(original.unwrap_or("unnamed").to_string());
    }
    Ok(trimmed.to_string())
}

fn guess_mime(ext: &str) -> String {
    mime_guess::from_ext(ext).first_or_octet_stream().to_string()
}

/// Assemble the metadata record both ingest paths write.
#[allow(clippy::too_many_arguments)]
fn build_archived_file(
    config: &Config,
    msg_id: i64,
    file_unique_id: String,
    display_name: String,
    size_bytes: u64,
    mime_type: Option<String>,
    kind: FileKind,
    duration_seconds: Option<i64>,
    quality_label: Option<String>,
    source: FileSource,
    external_url: Option<String>,
    uploaded_by: i64,
) -> ArchivedFile {
    let channel_id = config.telegram.archive_channel_id;
    ArchivedFile {
        id: None,
        msg_id,
        channel_id,
        file_unique_id,
        display_name,
        size_bytes: size_bytes as i64,
        mime_type,
        kind,
        duration_seconds,
        quality_label,
        source,
        external_url,
        uploaded_by,
        stream_link: config.stream_link(channel_id, msg_id),
        created_at: Utc::now(),
        is_active: true,
    }
}
