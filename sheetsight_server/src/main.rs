use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use sheetsight_agent::chat::ChatService;
use sheetsight_agent::llm::OpenAiCompatClient;
use sheetsight_agent::workflow::ChatWorkflow;
use sheetsight_core::analytics::AnalyticsCache;
use sheetsight_core::conversation::ConversationService;
use sheetsight_core::config::AppConfig;
use sheetsight_core::crawler::CrawlerService;
use sheetsight_core::limiter::SheetsRateLimiter;
use sheetsight_core::notify::Notifier;
use sheetsight_core::queue::TaskQueue;
use sheetsight_core::redis_backend::{self, RedisCache, RedisNotifier, RedisTaskQueue};
use sheetsight_core::sheets::{RestSheetsClient, SheetsClient};
use sheetsight_core::store::{
    ConnectionStore, MemoryDocumentStore, SheetRowStore, SyncStateStore,
};
use sheetsight_core::sync::SyncWorker;
use sheetsight_server::cli::{Cli, Commands};
use sheetsight_server::routes;
use sheetsight_server::state::AppState;

/// Process-wide handles built once at startup. The document-store driver is
/// deployment-provided; the in-process backend stands in for it here.
struct Handles {
    config: AppConfig,
    store: Arc<MemoryDocumentStore>,
    queue: Arc<dyn TaskQueue>,
    notifier: Arc<dyn Notifier>,
    cache: AnalyticsCache,
    sheets: Arc<dyn SheetsClient>,
    limiter: Arc<SheetsRateLimiter>,
}

async fn build_handles() -> anyhow::Result<Handles> {
    let config = AppConfig::from_env()?;
    let redis = redis_backend::connect(&config.redis_url).await?;
    let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::new(redis.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(RedisNotifier::new(redis.clone()));
    let cache = AnalyticsCache::new(Arc::new(RedisCache::new(redis)));
    let sheets: Arc<dyn SheetsClient> = Arc::new(RestSheetsClient::new(
        config.sheets_token.clone(),
        config.sheets_contact.clone(),
    ));
    let limiter = Arc::new(SheetsRateLimiter::new(config.rate_safety_factor));
    Ok(Handles {
        config,
        store: Arc::new(MemoryDocumentStore::new()),
        queue,
        notifier,
        cache,
        sheets,
        limiter,
    })
}

fn crawler(handles: &Handles) -> Arc<CrawlerService> {
    let connections: Arc<dyn ConnectionStore> = handles.store.clone();
    let sync_states: Arc<dyn SyncStateStore> = handles.store.clone();
    let rows: Arc<dyn SheetRowStore> = handles.store.clone();
    Arc::new(CrawlerService::new(
        connections,
        sync_states,
        rows,
        handles.sheets.clone(),
        handles.limiter.clone(),
        handles.cache.clone(),
        handles.notifier.clone(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sheetsight_core::o11y::init_tracing();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
    });

    match command {
        Commands::Serve { host, port } => {
            let handles = build_handles().await?;
            let llm = Arc::new(OpenAiCompatClient::new(
                handles.config.llm_api_base.clone(),
                handles.config.llm_api_key.clone(),
            ));
            let workflow = ChatWorkflow::new(
                llm,
                handles.store.clone() as Arc<dyn SheetRowStore>,
                handles.config.llm_model.clone(),
            );
            let chat = Arc::new(ChatService::new(
                ConversationService::new(handles.store.clone()),
                handles.store.clone() as Arc<dyn ConnectionStore>,
                workflow,
                handles.notifier.clone(),
                handles.config.llm_model.clone(),
            ));
            let state = Arc::new(AppState {
                config: handles.config.clone(),
                connections: handles.store.clone() as Arc<dyn ConnectionStore>,
                queue: handles.queue.clone(),
                chat,
            });

            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(%addr, "serving");
            axum::serve(listener, routes::router(state)).await?;
        }
        Commands::Worker => {
            let handles = build_handles().await?;
            let worker = Arc::new(SyncWorker::new(
                handles.queue.clone(),
                handles.config.sync_queue.clone(),
                handles.limiter.clone(),
                crawler(&handles),
                handles.store.clone() as Arc<dyn ConnectionStore>,
                handles.notifier.clone(),
            ));
            let handle = SyncWorker::start(worker);
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown signal received");
            handle.shutdown().await;
        }
        Commands::Check => {
            let config = AppConfig::from_env()?;
            match redis_backend::connect(&config.redis_url).await {
                Ok(manager) => {
                    let mut conn = manager.clone();
                    let pong: redis::RedisResult<String> =
                        redis::cmd("PING").query_async(&mut conn).await;
                    match pong {
                        Ok(_) => println!("redis: ok"),
                        Err(e) => println!("redis: error ({e})"),
                    }
                }
                Err(e) => println!("redis: error ({e})"),
            }

            let sheets = RestSheetsClient::new(config.sheets_token, config.sheets_contact);
            // A metadata probe against a known-bad id still proves auth and
            // connectivity are wired.
            match sheets.check_access("connectivity-probe").await {
                Ok(_) => println!("sheets: ok"),
                Err(e) => println!("sheets: error ({e})"),
            }
            println!(
                "queue: {} (name only; broker shared with redis)",
                config.sync_queue
            );
        }
    }

    Ok(())
}
