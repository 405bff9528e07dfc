use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::models::{Connection, Conversation, Message, SheetRow, SyncState};
use crate::Result;

/// Case-insensitive substring search over a fixed field set.
///
/// `pattern` must already be regex-escaped by the caller; the store compiles
/// it case-insensitively and matches any of `fields` inside the mapped
/// document.
#[derive(Debug, Clone)]
pub struct SearchFilter {
    pub pattern: String,
    pub fields: Vec<String>,
}

/// Filter/sort/page parameters for raw-row reads.
#[derive(Debug, Clone)]
pub struct RowQuery {
    pub connection_id: String,
    pub search: Option<SearchFilter>,
    /// Date-range filter applied to `data.<date_field>`.
    pub date_field: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Sort key inside the mapped document; `None` sorts by row number.
    pub sort_by: Option<String>,
    pub sort_desc: bool,
    pub skip: u64,
    pub limit: u64,
}

impl RowQuery {
    pub fn all_rows(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            search: None,
            date_field: None,
            date_from: None,
            date_to: None,
            sort_by: None,
            sort_desc: false,
            skip: 0,
            limit: u64::MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RowPage {
    pub rows: Vec<SheetRow>,
    /// Total matches before skip/limit.
    pub total: u64,
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn insert_connection(&self, connection: Connection) -> Result<()>;
    async fn find_connection(&self, id: &str) -> Result<Option<Connection>>;
    async fn find_connections_by_user(&self, user_id: &str) -> Result<Vec<Connection>>;
    async fn find_enabled_connections(&self) -> Result<Vec<Connection>>;
    async fn update_connection(&self, connection: &Connection) -> Result<()>;
    /// Destroys the connection and cascades to its sync-state and rows.
    async fn delete_connection(&self, id: &str) -> Result<bool>;
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn find_sync_state(&self, connection_id: &str) -> Result<Option<SyncState>>;
    async fn upsert_sync_state(&self, state: SyncState) -> Result<()>;
}

#[async_trait]
pub trait SheetRowStore: Send + Sync {
    /// Upsert by `(connection_id, row_number)`: re-syncing a row number
    /// replaces the document, never duplicates it.
    async fn upsert_row(&self, row: SheetRow) -> Result<()>;
    async fn find_rows(&self, query: &RowQuery) -> Result<RowPage>;
    async fn count_rows(&self, connection_id: &str) -> Result<u64>;
    /// Execute an aggregation pipeline over the sheet-row collection,
    /// returning the resulting document sequence.
    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Value>>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn insert_conversation(&self, conversation: Conversation) -> Result<()>;
    async fn find_conversation(
        &self,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<Conversation>>;
    /// Non-deleted conversations for a user, `updated_at` descending.
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>>;
    async fn update_conversation_title(&self, id: &str, title: &str) -> Result<()>;
    /// Insert the message and, atomically with it, bump the parent's
    /// `message_count`, `last_message_at`, and `updated_at`.
    async fn append_message(&self, message: Message) -> Result<()>;
    async fn find_message(&self, id: &str, include_deleted: bool) -> Result<Option<Message>>;
    /// Non-deleted messages for a conversation, `created_at` ascending.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;
    /// Soft-delete the conversation and all of its messages.
    async fn soft_delete_conversation(&self, id: &str) -> Result<bool>;
}
