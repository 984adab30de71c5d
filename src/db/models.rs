//! Document shapes for the metadata database

use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// Broad media class of an archived file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Video,
    Audio,
    Document,
}

/// How a file entered the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    DirectUpload,
    ExternalUrl,
}

/// One indexed file in the archive channel.
///
/// `(channel_id, msg_id)` is the identity: it forms the stream URL and the
/// upsert key. `size_bytes` is authoritative for `Content-Length` and range
/// validation on the read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedFile {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub msg_id: i64,
    pub channel_id: i64,

    /// Stable across re-references; used for deduplication
    pub file_unique_id: String,

    /// User-assigned name; any printable characters
    pub display_name: String,

    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub kind: FileKind,
    pub duration_seconds: Option<i64>,
    pub quality_label: Option<String>,

    pub source: FileSource,
    pub external_url: Option<String>,

    pub uploaded_by: i64,
    pub stream_link: String,

    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    /// Soft-delete flag; the archived message itself is never deleted
    #[serde(default = "default_true")]
    pub is_active: bool,
}

pub(crate) fn default_true() -> bool {
    true
}

/// Optional per-user record, written best-effort on first contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredUser {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub user_id: i64,

    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub first_seen: DateTime<Utc>,
}
