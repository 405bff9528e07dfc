//! In-memory document store for local development and unit tests.
//!
//! Semantics match what the core expects from the persistent collaborator:
//! atomic upsert by compound key, atomic message-append with counter
//! bump, soft-delete visibility rules, and native execution of the
//! aggregation-stage subset in [`super::pipeline`].

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use regex::RegexBuilder;
use serde_json::Value;
use tokio::sync::Mutex;

use super::pipeline::{self, cmp_values, get_path};
use super::traits::{
    ConnectionStore, ConversationStore, RowPage, RowQuery, SheetRowStore, SyncStateStore,
};
use crate::models::{Connection, Conversation, Message, SheetRow, SyncState};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    connections: Vec<Connection>,
    sync_states: HashMap<String, SyncState>,
    // (connection_id, row_number) -> row
    rows: HashMap<(String, u64), SheetRow>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<Inner>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows for a connection, ordered by row number
    /// (primarily for tests).
    pub async fn rows_for(&self, connection_id: &str) -> Vec<SheetRow> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<SheetRow> = inner
            .rows
            .values()
            .filter(|r| r.connection_id == connection_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.row_number);
        rows
    }
}

#[async_trait]
impl ConnectionStore for MemoryDocumentStore {
    async fn insert_connection(&self, connection: Connection) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.connections.iter().any(|c| c.id == connection.id) {
            return Err(Error::message(format!(
                "connection {} already exists",
                connection.id
            )));
        }
        inner.connections.push(connection);
        Ok(())
    }

    async fn find_connection(&self, id: &str) -> Result<Option<Connection>> {
        let inner = self.inner.lock().await;
        Ok(inner.connections.iter().find(|c| c.id == id).cloned())
    }

    async fn find_connections_by_user(&self, user_id: &str) -> Result<Vec<Connection>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .connections
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_enabled_connections(&self) -> Result<Vec<Connection>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .connections
            .iter()
            .filter(|c| c.sync_enabled)
            .cloned()
            .collect())
    }

    async fn update_connection(&self, connection: &Connection) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.connections.iter_mut().find(|c| c.id == connection.id) {
            Some(existing) => {
                *existing = connection.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("connection {}", connection.id))),
        }
    }

    async fn delete_connection(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.connections.len();
        inner.connections.retain(|c| c.id != id);
        let removed = inner.connections.len() != before;
        if removed {
            inner.sync_states.remove(id);
            inner.rows.retain(|(conn, _), _| conn != id);
        }
        Ok(removed)
    }
}

#[async_trait]
impl SyncStateStore for MemoryDocumentStore {
    async fn find_sync_state(&self, connection_id: &str) -> Result<Option<SyncState>> {
        let inner = self.inner.lock().await;
        Ok(inner.sync_states.get(connection_id).cloned())
    }

    async fn upsert_sync_state(&self, state: SyncState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .sync_states
            .insert(state.connection_id.clone(), state);
        Ok(())
    }
}

#[async_trait]
impl SheetRowStore for MemoryDocumentStore {
    async fn upsert_row(&self, row: SheetRow) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .rows
            .insert((row.connection_id.clone(), row.row_number), row);
        Ok(())
    }

    async fn find_rows(&self, query: &RowQuery) -> Result<RowPage> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<SheetRow> = Vec::new();

        let search_re = match &query.search {
            Some(search) => Some(
                RegexBuilder::new(&search.pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::message(format!("invalid search pattern: {e}")))?,
            ),
            None => None,
        };

        for row in inner.rows.values() {
            if row.connection_id != query.connection_id {
                continue;
            }
            if let (Some(re), Some(search)) = (&search_re, &query.search) {
                let hit = search.fields.iter().any(|field| {
                    get_path(&row.data, field)
                        .map(|v| match v {
                            Value::String(s) => re.is_match(s),
                            other => re.is_match(&other.to_string()),
                        })
                        .unwrap_or(false)
                });
                if !hit {
                    continue;
                }
            }
            if let Some(date_field) = &query.date_field {
                if query.date_from.is_some() || query.date_to.is_some() {
                    let Some(date) = get_path(&row.data, date_field)
                        .and_then(Value::as_str)
                        .and_then(|s| s.get(..10))
                        .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                    else {
                        continue;
                    };
                    if query.date_from.is_some_and(|from| date < from) {
                        continue;
                    }
                    if query.date_to.is_some_and(|to| date > to) {
                        continue;
                    }
                }
            }
            matched.push(row.clone());
        }

        match &query.sort_by {
            Some(field) => {
                matched.sort_by(|a, b| {
                    let va = get_path(&a.data, field).cloned().unwrap_or(Value::Null);
                    let vb = get_path(&b.data, field).cloned().unwrap_or(Value::Null);
                    let ord = cmp_values(&va, &vb);
                    if query.sort_desc {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
            None => {
                matched.sort_by(|a, b| {
                    let ord = a.row_number.cmp(&b.row_number);
                    if query.sort_desc {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
        }

        let total = matched.len() as u64;
        let rows = matched
            .into_iter()
            .skip(query.skip as usize)
            .take(query.limit.min(u64::from(u32::MAX)) as usize)
            .collect();
        Ok(RowPage { rows, total })
    }

    async fn count_rows(&self, connection_id: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .values()
            .filter(|r| r.connection_id == connection_id)
            .count() as u64)
    }

    async fn aggregate(&self, stages: &[Value]) -> Result<Vec<Value>> {
        let inner = self.inner.lock().await;
        let mut docs: Vec<SheetRow> = inner.rows.values().cloned().collect();
        docs.sort_by(|a, b| match a.connection_id.cmp(&b.connection_id) {
            Ordering::Equal => a.row_number.cmp(&b.row_number),
            other => other,
        });

        let mut by_connection: HashMap<String, Vec<Value>> = HashMap::new();
        let mut all = Vec::with_capacity(docs.len());
        for row in &docs {
            let doc = row.to_document();
            by_connection
                .entry(row.connection_id.clone())
                .or_default()
                .push(doc.clone());
            all.push(doc);
        }
        drop(inner);

        pipeline::run_pipeline(all, stages, &by_connection)
    }
}

#[async_trait]
impl ConversationStore for MemoryDocumentStore {
    async fn insert_conversation(&self, conversation: Conversation) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.conversations.push(conversation);
        Ok(())
    }

    async fn find_conversation(
        &self,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<Conversation>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .conversations
            .iter()
            .find(|c| c.id == id && (include_deleted || c.deleted_at.is_none()))
            .cloned())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Conversation> = inner
            .conversations
            .iter()
            .filter(|c| c.user_id == user_id && c.deleted_at.is_none())
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn update_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.conversations.iter_mut().find(|c| c.id == id) {
            Some(conversation) => {
                conversation.title = title.to_string();
                conversation.updated_at = Utc::now();
                Ok(())
            }
            None => Err(Error::NotFound(format!("conversation {id}"))),
        }
    }

    async fn append_message(&self, message: Message) -> Result<()> {
        // Insert + counter bump happen under one lock: the append is atomic
        // with respect to every other conversation mutation.
        let mut inner = self.inner.lock().await;
        let created_at = message.created_at;
        let conversation_id = message.conversation_id.clone();
        let conversation = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id && c.deleted_at.is_none())
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))?;
        conversation.message_count += 1;
        conversation.last_message_at = Some(created_at);
        conversation.updated_at = created_at;
        inner.messages.push(message);
        Ok(())
    }

    async fn find_message(&self, id: &str, include_deleted: bool) -> Result<Option<Message>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .find(|m| m.id == id && (include_deleted || m.deleted_at.is_none()))
            .cloned())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.deleted_at.is_none())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn soft_delete_conversation(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let Some(conversation) = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == id && c.deleted_at.is_none())
        else {
            return Ok(false);
        };
        conversation.deleted_at = Some(now);
        for message in inner
            .messages
            .iter_mut()
            .filter(|m| m.conversation_id == id && m.deleted_at.is_none())
        {
            message.deleted_at = Some(now);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageMetadata, MessageRole};
    use serde_json::json;

    fn row(conn: &str, n: u64, data: Value) -> SheetRow {
        SheetRow {
            connection_id: conn.to_string(),
            row_number: n,
            data,
            raw: json!({}),
            synced_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_key() {
        let store = MemoryDocumentStore::new();
        store
            .upsert_row(row("c1", 2, json!({"order_id": "O1"})))
            .await
            .unwrap();
        store
            .upsert_row(row("c1", 2, json!({"order_id": "O1b"})))
            .await
            .unwrap();
        let rows = store.rows_for("c1").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data["order_id"], json!("O1b"));
    }

    #[tokio::test]
    async fn delete_connection_cascades() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        store
            .insert_connection(Connection {
                id: "c1".into(),
                user_id: "u1".into(),
                sheet_id: "s1".into(),
                tab_name: "Orders".into(),
                column_mappings: vec![],
                header_row: 1,
                data_start_row: 2,
                sync_enabled: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        store
            .upsert_sync_state(SyncState::initial("c1"))
            .await
            .unwrap();
        store
            .upsert_row(row("c1", 2, json!({"order_id": "O1"})))
            .await
            .unwrap();

        assert!(store.delete_connection("c1").await.unwrap());
        assert!(store.find_connection("c1").await.unwrap().is_none());
        assert!(store.find_sync_state("c1").await.unwrap().is_none());
        assert_eq!(store.count_rows("c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn soft_deleted_messages_hidden_from_default_reads() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        store
            .insert_conversation(Conversation {
                id: "conv1".into(),
                user_id: "u1".into(),
                title: "New Conversation".into(),
                status: crate::models::ConversationStatus::Active,
                message_count: 0,
                last_message_at: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            })
            .await
            .unwrap();
        store
            .append_message(Message {
                id: "m1".into(),
                conversation_id: "conv1".into(),
                role: MessageRole::User,
                content: "hi".into(),
                attachments: vec![],
                metadata: MessageMetadata::default(),
                is_complete: true,
                created_at: now,
                deleted_at: None,
            })
            .await
            .unwrap();

        let conv = store.find_conversation("conv1", false).await.unwrap().unwrap();
        assert_eq!(conv.message_count, 1);
        assert_eq!(conv.last_message_at, Some(now));

        assert!(store.soft_delete_conversation("conv1").await.unwrap());
        assert!(store.find_conversation("conv1", false).await.unwrap().is_none());
        assert!(store.find_conversation("conv1", true).await.unwrap().is_some());
        assert!(store.list_messages("conv1").await.unwrap().is_empty());
        assert!(store.find_message("m1", true).await.unwrap().is_some());
        assert!(store.find_message("m1", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_rows_paginates_and_searches() {
        let store = MemoryDocumentStore::new();
        for n in 0..25u64 {
            store
                .upsert_row(row(
                    "c1",
                    n + 2,
                    json!({"order_id": format!("O{n}"), "platform": if n % 2 == 0 { "Shopee" } else { "Lazada" }}),
                ))
                .await
                .unwrap();
        }

        let mut query = RowQuery::all_rows("c1");
        query.skip = 20;
        query.limit = 10;
        let page = store.find_rows(&query).await.unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.rows.len(), 5);

        let mut query = RowQuery::all_rows("c1");
        query.search = Some(super::super::traits::SearchFilter {
            pattern: regex::escape("shopee"),
            fields: vec!["platform".into()],
        });
        let page = store.find_rows(&query).await.unwrap();
        assert_eq!(page.total, 13);
    }
}
