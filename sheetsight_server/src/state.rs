use std::sync::Arc;

use sheetsight_agent::chat::ChatService;
use sheetsight_core::config::AppConfig;
use sheetsight_core::queue::TaskQueue;
use sheetsight_core::store::ConnectionStore;

/// Handles shared by the request-facing routes. Built once at startup and
/// passed down explicitly.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub connections: Arc<dyn ConnectionStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub chat: Arc<ChatService>,
}
