use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::download::requery::{
    CONNECT_RETRY_DELAY, DHT_LOOKUP_TIMEOUT, MIN_MESSAGES_PER_CONNECTION, MIN_STABLE_CONNECTIONS,
    MIN_TOTAL_MESSAGES, REQUERY_COOLDOWN, SendPolicy, StabilityThresholds, SupervisorConfig,
};

fn default_log_level() -> String {
    "info".to_string()
}
fn default_requery_cooldown_secs() -> u64 {
    REQUERY_COOLDOWN.as_secs()
}
fn default_requery_connect_retry_delay_ms() -> u64 {
    CONNECT_RETRY_DELAY.as_millis() as u64
}
fn default_requery_min_stable_connections() -> u32 {
    MIN_STABLE_CONNECTIONS
}
fn default_requery_min_messages_per_connection() -> u64 {
    MIN_MESSAGES_PER_CONNECTION
}
fn default_requery_min_total_messages() -> u64 {
    MIN_TOTAL_MESSAGES
}
fn default_requery_dht_lookup_timeout_secs() -> u64 {
    DHT_LOOKUP_TIMEOUT.as_secs()
}
fn default_requery_poll_every_ms() -> u64 {
    1000
}
fn default_requery_max_dht_queries() -> u32 {
    2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub requery: RequeryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequeryConfig {
    /// Minimum wait between requeries of one download.
    pub cooldown_secs: u64,
    /// Retry hint while connections are not stable yet.
    pub connect_retry_delay_ms: u64,
    pub min_stable_connections: u32,
    pub min_messages_per_connection: u64,
    pub min_total_messages: u64,
    pub dht_lookup_timeout_secs: u64,

    /// How often the requery service checks a download. Must be non-zero.
    pub poll_every_ms: u64,
    pub max_dht_queries: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for RequeryConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_requery_cooldown_secs(),
            connect_retry_delay_ms: default_requery_connect_retry_delay_ms(),
            min_stable_connections: default_requery_min_stable_connections(),
            min_messages_per_connection: default_requery_min_messages_per_connection(),
            min_total_messages: default_requery_min_total_messages(),
            dht_lookup_timeout_secs: default_requery_dht_lookup_timeout_secs(),
            poll_every_ms: default_requery_poll_every_ms(),
            max_dht_queries: default_requery_max_dht_queries(),
        }
    }
}

impl RequeryConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.poll_every_ms == 0 {
            return Err("requery.poll_every_ms must be greater than zero");
        }
        if self.cooldown_secs == 0 {
            return Err("requery.cooldown_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn supervisor_config(&self, policy: SendPolicy) -> SupervisorConfig {
        SupervisorConfig {
            cooldown: Duration::from_secs(self.cooldown_secs),
            connect_retry_delay: Duration::from_millis(self.connect_retry_delay_ms),
            dht_lookup_timeout: Duration::from_secs(self.dht_lookup_timeout_secs),
            thresholds: StabilityThresholds {
                min_stable_connections: self.min_stable_connections,
                min_messages_per_connection: self.min_messages_per_connection,
                min_total_messages: self.min_total_messages,
            },
            policy,
        }
    }
}

pub fn init_tracing(config: &Config) {
    // Priority order:
    // 1) RUST_LOG
    // 2) general.log_level from config.toml
    // 3) info
    //
    // Example:
    // RUST_LOG=info,rust_mule_requery=debug
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| Some(config.general.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}
