use serde::Deserialize;
use std::time::Duration;

/// Pool ceiling when `ULTRA_MINIMAL_DB` is set.
const ULTRA_MINIMAL_POOL_MAX: usize = 2;

/// Shortest accepted health polling period.
const MIN_HEALTH_CHECK_INTERVAL_MS: u64 = 1;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // HTTP
    pub port: u16,
    pub node_env: String,
    pub debug: bool,

    // Database
    pub database_url: Option<String>,
    pub ultra_minimal_db: bool,
    pub db_pool_max: usize,
    pub db_pool_min: usize,
    pub db_idle_timeout_ms: u64,

    // Auth
    pub session_secret: Option<String>,

    // Health
    pub health_check_token: Option<String>,
    pub health_check_interval_ms: u64,
    pub external_health_apis: Vec<(String, String)>,

    // Lifecycle
    pub shutdown_timeout_ms: u64,
    pub shutdown_force_timeout_ms: u64,
    pub boot_background_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            node_env: "development".to_string(),
            debug: false,
            database_url: None,
            ultra_minimal_db: false,
            db_pool_max: 10,
            db_pool_min: 0,
            db_idle_timeout_ms: 30_000,
            session_secret: None,
            health_check_token: None,
            health_check_interval_ms: 30_000,
            external_health_apis: Vec::new(),
            shutdown_timeout_ms: 10_000,
            shutdown_force_timeout_ms: 5_000,
            boot_background_delay_ms: 100,
        }
    }
}

impl Config {
    pub fn is_development(&self) -> bool {
        self.node_env == "development"
    }

    pub fn is_production(&self) -> bool {
        self.node_env == "production"
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Pool ceiling after applying `ULTRA_MINIMAL_DB`.
    pub fn pool_max(&self) -> usize {
        let max = self.db_pool_max.max(1);
        if self.ultra_minimal_db {
            max.min(ULTRA_MINIMAL_POOL_MAX)
        } else {
            max
        }
    }

    pub fn pool_min(&self) -> usize {
        self.db_pool_min.min(self.pool_max())
    }

    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.db_idle_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn shutdown_force_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_force_timeout_ms)
    }

    pub fn boot_background_delay(&self) -> Duration {
        Duration::from_millis(self.boot_background_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(MIN_HEALTH_CHECK_INTERVAL_MS))
    }
}

/// Parse `name=url,name=url`. Malformed entries are skipped.
pub fn parse_external_apis(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, url) = entry.split_once('=')?;
            let (name, url) = (name.trim(), url.trim());
            if name.is_empty() || url.is_empty() {
                tracing::warn!("ignoring malformed EXTERNAL_HEALTH_APIS entry: {}", entry);
                return None;
            }
            Some((name.to_string(), url.to_string()))
        })
        .collect()
}

fn parse_flag(v: &str) -> bool {
    v == "1" || v.to_lowercase() == "true"
}

pub fn load_config() -> anyhow::Result<Config> {
    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "5000".to_string())
        .parse()
        .unwrap_or(5000);

    let node_env = std::env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string());

    let debug = std::env::var("DEBUG")
        .map(|v| parse_flag(&v))
        .unwrap_or(false);

    // Database settings
    let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

    let ultra_minimal_db = std::env::var("ULTRA_MINIMAL_DB")
        .map(|v| parse_flag(&v))
        .unwrap_or(false);

    let db_pool_max = std::env::var("DB_POOL_MAX")
        .unwrap_or_else(|_| "10".to_string())
        .parse()
        .unwrap_or(10);

    let db_pool_min = std::env::var("DB_POOL_MIN")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    let db_idle_timeout_ms = std::env::var("DB_IDLE_TIMEOUT")
        .unwrap_or_else(|_| "30000".to_string())
        .parse()
        .unwrap_or(30_000);

    let session_secret = std::env::var("SESSION_SECRET").ok().filter(|v| !v.is_empty());

    // Health settings
    let health_check_token = std::env::var("HEALTH_CHECK_TOKEN")
        .ok()
        .filter(|v| !v.is_empty());

    let mut health_check_interval_ms = std::env::var("HEALTH_CHECK_INTERVAL_MS")
        .unwrap_or_else(|_| "30000".to_string())
        .parse()
        .unwrap_or(30_000);
    if health_check_interval_ms < MIN_HEALTH_CHECK_INTERVAL_MS {
        tracing::warn!(
            "HEALTH_CHECK_INTERVAL_MS={} is too short, using {}ms",
            health_check_interval_ms,
            MIN_HEALTH_CHECK_INTERVAL_MS
        );
        health_check_interval_ms = MIN_HEALTH_CHECK_INTERVAL_MS;
    }

    let external_health_apis = std::env::var("EXTERNAL_HEALTH_APIS")
        .map(|v| parse_external_apis(&v))
        .unwrap_or_default();

    // Lifecycle settings
    let shutdown_timeout_ms = std::env::var("SHUTDOWN_TIMEOUT_MS")
        .unwrap_or_else(|_| "10000".to_string())
        .parse()
        .unwrap_or(10_000);

    let shutdown_force_timeout_ms = std::env::var("SHUTDOWN_FORCE_TIMEOUT_MS")
        .unwrap_or_else(|_| "5000".to_string())
        .parse()
        .unwrap_or(5_000);

    let boot_background_delay_ms = std::env::var("BOOT_BACKGROUND_DELAY_MS")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .unwrap_or(100);

    Ok(Config {
        port,
        node_env,
        debug,
        database_url,
        ultra_minimal_db,
        db_pool_max,
        db_pool_min,
        db_idle_timeout_ms,
        session_secret,
        health_check_token,
        health_check_interval_ms,
        external_health_apis,
        shutdown_timeout_ms,
        shutdown_force_timeout_ms,
        boot_background_delay_ms,
    })
}
