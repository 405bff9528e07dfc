//! Document-store boundary.
//!
//! The persistent driver is an external collaborator; the core talks to it
//! through the per-entity traits in [`traits`] and validates everything
//! itself (no schema enforcement is assumed). [`memory`] is the in-process
//! backend used for development and tests; it executes the same aggregation
//! pipelines the analytics engine and agent tools emit, interpreted by
//! [`pipeline`].

pub mod memory;
pub mod pipeline;
pub mod traits;

pub use memory::MemoryDocumentStore;
pub use traits::{
    ConnectionStore, ConversationStore, RowPage, RowQuery, SearchFilter, SheetRowStore,
    SyncStateStore,
};
