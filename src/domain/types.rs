use crate::util::now_iso;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Schema marker recorded both per-row (`version`) and in the `metadata`
/// table (`schemaVersion`).
pub const SCHEMA_VERSION: i64 = 2;

/// One row of the metadata store, keyed by `session_id`.
///
/// Field provenance matters: the user-preference group is only ever written
/// by the update API, the indexed group only by the indexer. The store's
/// upsert paths keep the two groups from clobbering each other.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,

    // User-preference fields.
    pub custom_name: String,
    pub pinned: bool,
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub continuation_session_id: Option<String>,
    pub initial_commit_head: String,
    pub permission_mode: String,

    // Indexed fields.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub project_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file_path: Option<PathBuf>,
    pub message_count: u64,
    pub total_duration_ms: u64,
    pub model: String,
    pub last_scanned_at_ms: i64,

    // Bookkeeping.
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl SessionRecord {
    /// Fresh row with default user preferences, as inserted by
    /// `get_or_create` and by indexer upserts for unknown sessions.
    pub fn new_default(session_id: &str) -> Self {
        let now = now_iso();
        Self {
            session_id: session_id.to_string(),
            custom_name: String::new(),
            pinned: false,
            archived: false,
            continuation_session_id: None,
            initial_commit_head: String::new(),
            permission_mode: "default".to_string(),
            summary: None,
            project_path: None,
            file_path: None,
            message_count: 0,
            total_duration_ms: 0,
            model: "Unknown".to_string(),
            last_scanned_at_ms: 0,
            version: SCHEMA_VERSION,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Partial update of the user-preference field group. `None` leaves a field
/// untouched; `Some` overwrites it.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoUpdate {
    pub custom_name: Option<String>,
    pub pinned: Option<bool>,
    pub archived: Option<bool>,
    pub continuation_session_id: Option<String>,
    pub initial_commit_head: Option<String>,
    pub permission_mode: Option<String>,
}

/// Derived view of one session log, produced by the scanner and consumed by
/// the indexer's batch upsert.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedMetadata {
    pub session_id: String,
    pub file_path: PathBuf,
    pub summary: Option<String>,
    pub project_path: Option<PathBuf>,
    pub message_count: u64,
    pub total_duration_ms: u64,
    pub model: Option<String>,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    pub last_scanned_at_ms: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Assistant,
    System,
}

/// One entry of a conversation, as read back from a session log. The
/// `message` payload is kept opaque: either a plain string or an object
/// whose `content` is a string or a list of typed blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_uuid: Option<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub is_sidechain: bool,
    #[serde(
        rename = "workingDirectory",
        alias = "cwd",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub message: Value,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    CreatedAt,
    #[default]
    UpdatedAt,
}

impl SortKey {
    pub fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Filter + pagination for the list endpoint. Absent filters match
/// everything; `total` in the result reflects the filter but not the page.
#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    pub project_path: Option<String>,
    pub archived: Option<bool>,
    pub pinned: Option<bool>,
    pub has_continuation: Option<bool>,
    pub sort_by: SortKey,
    pub order: SortOrder,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub count: u64,
    pub byte_size: u64,
    pub last_updated: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListUpdateKind {
    Created,
    Modified,
}

/// Events pushed to attached stream clients. Wire format is stable: tags and
/// field names below are what browsers already parse, including the
/// `streaming_id` / `streamingId` asymmetry between `connected` and `closed`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected {
        streaming_id: String,
        timestamp: String,
    },
    Closed {
        #[serde(rename = "streamingId")]
        streaming_id: String,
        timestamp: String,
    },
    IndexUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        timestamp: String,
    },
    SessionListUpdate {
        data: SessionListUpdateData,
    },
    SessionContentUpdate {
        data: SessionContentUpdateData,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionListUpdateData {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "eventType")]
    pub event_type: ListUpdateKind,
    pub metadata: SessionRecord,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionContentUpdateData {
    pub messages: Vec<ConversationMessage>,
}

/// Channel name for per-session content pushes.
pub fn session_channel(session_id: &str) -> String {
    format!("session-{session_id}")
}
