//! Metadata store
//!
//! Thin async wrapper over MongoDB indexing archived files by message id.
//! The streaming path reads it on every request; the ingest path writes it.
//! Index bootstrap verifies the expected indexes at startup and logs a
//! warning instead of aborting when creation fails.

mod models;

pub use models::{ArchivedFile, FileKind, FileSource, StoredUser};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::util::mask_url;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use tracing::{debug, info, warn};

/// Hard ceiling for catalog page sizes
pub const MAX_PER_PAGE: u64 = 100;

/// Result cap for text search
const SEARCH_LIMIT: i64 = 20;

/// Operations the rest of the system needs from the metadata index.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Idempotent upsert keyed by `(channel_id, msg_id)`.
    async fn put_file(&self, record: &ArchivedFile) -> Result<()>;

    /// Look up a record by its archive position. Returns soft-deleted
    /// records too; callers decide visibility.
    async fn get_by_msg_id(&self, channel_id: i64, msg_id: i64) -> Result<Option<ArchivedFile>>;

    /// Active records, newest first. `page` is zero-based.
    async fn list_catalog(&self, page: u64, per_page: u64) -> Result<Vec<ArchivedFile>>;

    /// Active records of one uploader, newest first.
    async fn list_by_user(&self, user_id: i64, page: u64, per_page: u64)
        -> Result<Vec<ArchivedFile>>;

    /// Text search over display names within one uploader's records.
    async fn search(&self, user_id: i64, query: &str) -> Result<Vec<ArchivedFile>>;

    /// Set `is_active = false`. Returns false when no record matched.
    async fn soft_delete(&self, msg_id: i64) -> Result<bool>;

    /// Number of active records.
    async fn count_active(&self) -> Result<u64>;

    /// Best-effort first-contact record; default is a no-op.
    async fn record_user(&self, _user_id: i64) -> Result<()> {
        Ok(())
    }
}

/// MongoDB-backed implementation.
pub struct MongoFileRepo {
    files: Collection<ArchivedFile>,
    users: Collection<StoredUser>,
}

impl MongoFileRepo {
    /// Connect and select collections. Logs only the masked cluster host.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to MongoDB at {}", mask_url(&config.uri));

        let client = Client::with_uri_str(&config.uri).await?;
        let db = client.database(&config.name);

        Ok(MongoFileRepo {
            files: db.collection("files"),
            users: db.collection("users"),
        })
    }

    /// Create the indexes the query paths rely on: unique `msg_id`,
    /// `uploaded_by`, `created_at` descending, text over `display_name`.
    /// Failures are logged and tolerated; queries still work, slower.
    pub async fn ensure_indexes(&self) {
        let models = [
            IndexModel::builder()
                .keys(doc! { "msg_id": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder().keys(doc! { "uploaded_by": 1 }).build(),
            IndexModel::builder().keys(doc! { "created_at": -1 }).build(),
            IndexModel::builder()
                .keys(doc! { "display_name": "text" })
                .build(),
        ];

        for model in models {
            let keys = model.keys.clone();
            match self.files.create_index(model).await {
                Ok(created) => debug!("Index ready: {}", created.index_name),
                Err(e) => warn!("Missing index {:?} could not be created: {}", keys, e),
            }
        }
    }
}

#[async_trait]
impl FileRepo for MongoFileRepo {
    async fn put_file(&self, record: &ArchivedFile) -> Result<()> {
        let mut update = mongodb::bson::to_document(record)
            .map_err(|e| Error::Database(e.to_string()))?;
        update.remove("_id");

        self.files
            .update_one(
                doc! { "channel_id": record.channel_id, "msg_id": record.msg_id },
                doc! { "$set": update },
            )
            .upsert(true)
            .await?;

        info!(
            "File indexed: msg_id={}, name={}, size={}, user={}",
            record.msg_id,
            record.display_name,
            crate::util::format_size(record.size_bytes.max(0) as u64),
            record.uploaded_by
        );
        Ok(())
    }

    async fn get_by_msg_id(&self, channel_id: i64, msg_id: i64) -> Result<Option<ArchivedFile>> {
        let found = self
            .files
            .find_one(doc! { "channel_id": channel_id, "msg_id": msg_id })
            .await?;
        Ok(found)
    }

    async fn list_catalog(&self, page: u64, per_page: u64) -> Result<Vec<ArchivedFile>> {
        let per_page = per_page.min(MAX_PER_PAGE);
        let cursor = self
            .files
            .find(doc! { "is_active": true })
            .sort(doc! { "created_at": -1 })
            .skip(page.saturating_mul(per_page))
            .limit(per_page as i64)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        page: u64,
        per_page: u64,
    ) -> Result<Vec<ArchivedFile>> {
        let per_page = per_page.min(MAX_PER_PAGE);
        let cursor = self
            .files
            .find(doc! { "is_active": true, "uploaded_by": user_id })
            .sort(doc! { "created_at": -1 })
            .skip(page.saturating_mul(per_page))
            .limit(per_page as i64)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn search(&self, user_id: i64, query: &str) -> Result<Vec<ArchivedFile>> {
        let cursor = self
            .files
            .find(doc! {
                "is_active": true,
                "uploaded_by": user_id,
                "$text": { "$search": query },
            })
            .sort(doc! { "created_at": -1 })
            .limit(SEARCH_LIMIT)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn soft_delete(&self, msg_id: i64) -> Result<bool> {
        let result = self
            .files
            .update_one(
                doc! { "msg_id": msg_id },
                doc! { "$set": { "is_active": false } },
            )
            .await?;

        if result.matched_count > 0 {
            info!("File soft-deleted: msg_id={}", msg_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn count_active(&self) -> Result<u64> {
        Ok(self
            .files
            .count_documents(doc! { "is_active": true })
            .await?)
    }

    async fn record_user(&self, user_id: i64) -> Result<()> {
        let result = self
            .users
            .update_one(
                doc! { "user_id": user_id },
                doc! { "$setOnInsert": {
                    "user_id": user_id,
                    "first_seen": mongodb::bson::DateTime::now(),
                } },
            )
            .upsert(true)
            .await;

        if let Err(e) = result {
            debug!("User record write skipped: {}", e);
        }
        Ok(())
    }
}
