//! Static chat configuration, read once at startup.

use di::{inject, injectable};
use log::warn;
use serde::{Deserialize, Serialize};

/// Models offered when `CHAT_MODELS` is not set.
pub const DEFAULT_MODELS: &[&str] = &[
    "Llama-3.2-1B-Instruct-q4f16_1-MLC",
    "Qwen2.5-1.5B-Instruct-q4f16_1-MLC",
    "Phi-3.5-mini-instruct-q4f16_1-MLC",
];

/// Base URL of the OpenAI-compatible inference server.
pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8080";

/// Address the HTTP front-end listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

/// Cache directory handed to the engine when `CHAT_CACHE_DIR` is not set.
pub const DEFAULT_CACHE_DIR: &str = "cache";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_id: String,
}

/// Weight/prompt caching options forwarded to the engine binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    pub enable_cache: bool,
    pub cache_dir: String,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache_dir: DEFAULT_CACHE_DIR.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Catalog of selectable model identifiers.
    pub model_list: Vec<ModelRecord>,
    /// Run the engine on a dedicated background worker instead of in-process.
    pub use_worker: bool,
    pub cache_options: CacheOptions,
    pub engine_url: String,
    pub listen_addr: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model_list: DEFAULT_MODELS
                .iter()
                .map(|id| ModelRecord {
                    model_id: (*id).to_owned(),
                })
                .collect(),
            use_worker: true,
            cache_options: CacheOptions::default(),
            engine_url: DEFAULT_ENGINE_URL.to_owned(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
        }
    }
}

impl ChatConfig {
    /// Loads `.env` (if present) and reads the configuration from the environment.
    pub fn from_env() -> ChatConfig {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ChatConfig {
        let mut config = ChatConfig::default();

        if let Some(models) = lookup("CHAT_MODELS") {
            let model_list: Vec<ModelRecord> = models
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| ModelRecord {
                    model_id: id.to_owned(),
                })
                .collect();

            if model_list.is_empty() {
                warn!("CHAT_MODELS is empty, keeping the default catalog");
            } else {
                config.model_list = model_list;
            }
        }

        config.use_worker = read_flag(&lookup, "CHAT_USE_WORKER", config.use_worker);
        config.cache_options.enable_cache = read_flag(
            &lookup,
            "CHAT_CACHE_ENABLED",
            config.cache_options.enable_cache,
        );

        if let Some(dir) = lookup("CHAT_CACHE_DIR").filter(|dir| !dir.trim().is_empty()) {
            config.cache_options.cache_dir = dir;
        }
        if let Some(url) = lookup("ENGINE_URL").filter(|url| !url.trim().is_empty()) {
            config.engine_url = url.trim_end_matches('/').to_owned();
        }
        if let Some(addr) = lookup("LISTEN_ADDR").filter(|addr| !addr.trim().is_empty()) {
            config.listen_addr = addr;
        }

        config
    }

    pub fn has_model(&self, model_id: &str) -> bool {
        self.model_list.iter().any(|m| m.model_id == model_id)
    }
}

#[injectable]
impl ChatConfig {
    #[inject]
    pub fn create() -> ChatConfig {
        ChatConfig::from_env()
    }
}

fn read_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key) {
        None => default,
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!("{key}={other:?} is not a boolean, using {default}");
                default
            }
        },
    }
}
