use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared type of a mapped column. Coercion to these types is best-effort:
/// a cell that fails to coerce keeps its original string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Integer,
    Date,
}

/// One entry of a connection's ordered column mapping.
///
/// `sheet_column` is either a column letter (`A`, `B`, ..., `AA`, ...) or a
/// header-name string resolved against the header row at sync time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub system_field: String,
    pub sheet_column: String,
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
}

/// A user's binding to one external sheet tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub sheet_id: String,
    pub tab_name: String,
    pub column_mappings: Vec<ColumnMapping>,
    /// 1-based row holding the header cells.
    pub header_row: u64,
    /// 1-based first data row.
    pub data_start_row: u64,
    pub sync_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Success,
    Failed,
}

/// Per-connection sync cursor. Created lazily on the first sync attempt.
///
/// Invariant: after a successful sync `last_synced_row` equals the highest
/// row number processed in that run; rows at or below it are never
/// re-fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub connection_id: String,
    pub last_synced_row: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub last_error: Option<String>,
    pub total_rows_synced: u64,
}

impl SyncState {
    pub fn initial(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            last_synced_row: 0,
            last_sync_time: None,
            status: SyncStatus::Pending,
            last_error: None,
            total_rows_synced: 0,
        }
    }
}

/// One persisted sheet row, keyed by `(connection_id, row_number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetRow {
    pub connection_id: String,
    /// 1-based position in the source tab.
    pub row_number: u64,
    /// Mapped document: system field -> coerced value.
    pub data: Value,
    /// Raw cells keyed by header name.
    pub raw: Value,
    pub synced_at: DateTime<Utc>,
}

impl SheetRow {
    /// Document shape handed to the aggregation pipeline.
    pub fn to_document(&self) -> Value {
        serde_json::json!({
            "connection_id": self.connection_id,
            "row_number": self.row_number,
            "data": self.data,
            "raw": self.raw,
            "synced_at": self.synced_at.to_rfc3339(),
        })
    }
}

/// Transient queue payload for one sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub connection_id: String,
    pub user_id: String,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl SyncTask {
    pub fn new(connection_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            queued_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn retried(&self) -> Self {
        Self {
            connection_id: self.connection_id.clone(),
            user_id: self.user_id.clone(),
            queued_at: Utc::now(),
            retry_count: self.retry_count + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
}

/// A conversation owned by one user. Soft-deleted records stay in the store
/// but are excluded from every default read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub status: ConversationStatus,
    pub message_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub url: String,
    pub content_type: String,
}

/// One tool invocation recorded on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMeta {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub model: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub latency_ms: Option<i64>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallMeta>,
    /// Correlation id when this is a tool-role message.
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: MessageMetadata,
    /// False while a stream is still in progress.
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}
