use std::{env, fmt::Display, str::FromStr};

use tracing::{info, warn};

pub struct Config {
    pub port: u16,
    pub workers: usize,
    pub store_root: String,
    pub database_url: Option<String>,
    pub min_connections: u32,
    pub max_connections: u32,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
}

impl Config {
    /// Read configuration from the environment (after `.env` is loaded),
    /// falling back to defaults for anything unset or unparsable.
    pub fn load() -> Self {
        Self {
            port: try_load("RUST_PORT", 5000),
            workers: try_load("WORKERS", 4),
            store_root: try_load("STORE_ROOT", "study_boosters".to_string()),
            database_url: optional("DATABASE_URL"),
            min_connections: try_load("DB_MIN_CONNECTIONS", 2),
            max_connections: try_load("DB_MAX_CONNECTIONS", 3),
            gemini_api_key: optional("GEMINI_API_KEY").or_else(|| optional("API_KEY")),
            gemini_model: try_load("GEMINI_MODEL", "gemini-1.5-flash".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            workers: 4,
            store_root: "study_boosters".to_string(),
            database_url: None,
            min_connections: 2,
            max_connections: 3,
            gemini_api_key: None,
            gemini_model: "gemini-1.5-flash".to_string(),
        }
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = optional(key) else {
        info!("{key} not set, using default: {default}");
        return default;
    };

    raw.trim().parse().unwrap_or_else(|e| {
        warn!("Invalid {key} value: {e}, using default: {default}");
        default
    })
}
