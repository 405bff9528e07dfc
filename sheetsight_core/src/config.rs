use crate::{Error, Result};

pub const DEFAULT_SYNC_QUEUE: &str = "sheet_sync_tasks";
pub const DEFAULT_LLM_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_RATE_SAFETY_FACTOR: f64 = 0.8;

/// Process configuration, read once at startup.
///
/// Every required value missing from the environment is fatal: the process
/// refuses to start rather than limping along with a partially wired stack.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Redis URL shared by the cache, the sync queue, and the notifier broker.
    pub redis_url: String,
    pub sync_queue: String,

    /// Bearer token for the source-sheet REST API.
    pub sheets_token: String,
    /// Service-account address surfaced in share-your-sheet error messages.
    pub sheets_contact: String,

    /// Shared secret for the internal trigger endpoint.
    pub internal_api_key: String,

    pub llm_api_base: String,
    pub llm_api_key: String,
    pub llm_model: String,

    /// Scaling applied to both rate-limiter buckets at construction.
    pub rate_safety_factor: f64,
}

impl AppConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            redis_url: required("SHEETSIGHT_REDIS_URL")?,
            sync_queue: optional("SHEETSIGHT_SYNC_QUEUE")
                .unwrap_or_else(|| DEFAULT_SYNC_QUEUE.to_string()),
            sheets_token: required("SHEETSIGHT_SHEETS_TOKEN")?,
            sheets_contact: required("SHEETSIGHT_SHEETS_CONTACT")?,
            internal_api_key: required("SHEETSIGHT_INTERNAL_API_KEY")?,
            llm_api_base: optional("SHEETSIGHT_LLM_API_BASE")
                .unwrap_or_else(|| DEFAULT_LLM_API_BASE.to_string()),
            llm_api_key: required("SHEETSIGHT_LLM_API_KEY")?,
            llm_model: optional("SHEETSIGHT_LLM_MODEL")
                .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            rate_safety_factor: match optional("SHEETSIGHT_RATE_SAFETY_FACTOR") {
                Some(raw) => raw.parse::<f64>().map_err(|e| {
                    Error::Config(format!("SHEETSIGHT_RATE_SAFETY_FACTOR: {e}"))
                })?,
                None => DEFAULT_RATE_SAFETY_FACTOR,
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_queue.trim().is_empty() {
            return Err(Error::Config("sync queue name is empty".into()));
        }
        if !(self.rate_safety_factor > 0.0 && self.rate_safety_factor <= 1.0) {
            return Err(Error::Config(format!(
                "rate safety factor must be in (0, 1], got {}",
                self.rate_safety_factor
            )));
        }
        Ok(())
    }
}

fn required(name: &str) -> Result<String> {
    match optional(name) {
        Some(v) => Ok(v),
        None => Err(Error::Config(format!("missing required env var {name}"))),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
