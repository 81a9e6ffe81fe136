//! TOML configuration parsing and validation.
//!
//! The configuration file (default `./config/htl.toml`) names the SQLite
//! database, the HTTP bind address, scrape scheduling knobs, the tag cache
//! TTL, the optional chat extractor, and the channels polled per record kind.
//!
//! ```toml
//! [db]
//! path = "./data/htl.sqlite"
//!
//! [server]
//! bind = "0.0.0.0:10000"
//!
//! [channels.hacking.defimon]
//! url = "https://feeds.example/defimon"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hack_timeline_core::models::RecordKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub extractor: Option<ExtractorConfig>,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScrapeConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_initial_fetch_limit")]
    pub initial_fetch_limit: usize,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
    /// Upper bound on concurrent extract+store tasks per channel.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Failed attempts after which a post is dropped from the retry queue.
    /// `0` keeps retrying forever.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            initial_fetch_limit: default_initial_fetch_limit(),
            fetch_limit: default_fetch_limit(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
            max_in_flight: default_max_in_flight(),
            max_attempts: 0,
        }
    }
}

fn default_interval_secs() -> u64 {
    600
}
fn default_initial_fetch_limit() -> usize {
    200
}
fn default_fetch_limit() -> usize {
    100
}
fn default_cycle_timeout_secs() -> u64 {
    180
}
fn default_max_in_flight() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_tag_ttl_secs")]
    pub tag_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tag_ttl_secs: default_tag_ttl_secs(),
        }
    }
}

fn default_tag_ttl_secs() -> u64 {
    15 * 60
}

/// OpenAI-compatible chat completion endpoint used to extract hacking records.
#[derive(Debug, Deserialize, Clone)]
pub struct ExtractorConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

/// Named channel instances per record kind.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub hacking: BTreeMap<String, FeedChannelConfig>,
    #[serde(default)]
    pub transfer: BTreeMap<String, FeedChannelConfig>,
}

impl ChannelsConfig {
    pub fn for_kind(&self, kind: RecordKind) -> &BTreeMap<String, FeedChannelConfig> {
        match kind {
            RecordKind::Hacking => &self.hacking,
            RecordKind::Transfer => &self.transfer,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedChannelConfig {
    pub url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_page_size() -> usize {
    100
}

impl Config {
    /// A config with no channels, for tools that only read the database.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig {
                bind: "127.0.0.1:10000".to_string(),
            },
            scrape: ScrapeConfig::default(),
            cache: CacheConfig::default(),
            extractor: None,
            channels: ChannelsConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let scrape = &config.scrape;
    if scrape.interval_secs == 0 {
        anyhow::bail!("scrape.interval_secs must be > 0");
    }
    if scrape.fetch_limit == 0 || scrape.initial_fetch_limit == 0 {
        anyhow::bail!("scrape.fetch_limit and scrape.initial_fetch_limit must be > 0");
    }
    if scrape.cycle_timeout_secs == 0 {
        anyhow::bail!("scrape.cycle_timeout_secs must be > 0");
    }
    if scrape.max_in_flight == 0 {
        anyhow::bail!("scrape.max_in_flight must be >= 1");
    }
    if config.cache.tag_ttl_secs == 0 {
        anyhow::bail!("cache.tag_ttl_secs must be >= 1");
    }

    for kind in RecordKind::ALL {
        for (name, channel) in config.channels.for_kind(kind) {
            if channel.url.trim().is_empty() {
                anyhow::bail!("channels.{}.{}.url must not be empty", kind, name);
            }
            if channel.page_size == 0 {
                anyhow::bail!("channels.{}.{}.page_size must be > 0", kind, name);
            }
        }
    }

    if let Some(extractor) = &config.extractor {
        if extractor.model.trim().is_empty() {
            anyhow::bail!("extractor.model must not be empty");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        validate(&config)?;
        Ok(config)
    }

    const BASE: &str = r#"
[db]
path = "./data/htl.sqlite"

[server]
bind = "127.0.0.1:10000"
"#;

    #[test]
    fn defaults_apply() {
        let config = parse(BASE).unwrap();
        assert_eq!(config.scrape.interval_secs, 600);
        assert_eq!(config.scrape.initial_fetch_limit, 200);
        assert_eq!(config.scrape.fetch_limit, 100);
        assert_eq!(config.scrape.max_attempts, 0);
        assert_eq!(config.cache.tag_ttl_secs, 900);
        assert!(config.extractor.is_none());
        assert!(config.channels.hacking.is_empty());
    }

    #[test]
    fn channels_are_keyed_by_kind() {
        let text = format!(
            "{}\n[channels.hacking.defimon]\nurl = \"http://x/h\"\n\n[channels.transfer.whales]\nurl = \"http://x/t\"\npage_size = 50\n",
            BASE
        );
        let config = parse(&text).unwrap();
        assert_eq!(config.channels.for_kind(RecordKind::Hacking).len(), 1);
        let whales = &config.channels.for_kind(RecordKind::Transfer)["whales"];
        assert_eq!(whales.page_size, 50);
    }

    #[test]
    fn rejects_zero_in_flight() {
        let text = format!("{}\n[scrape]\nmax_in_flight = 0\n", BASE);
        assert!(parse(&text).is_err());
    }

    #[test]
    fn rejects_blank_channel_url() {
        let text = format!("{}\n[channels.hacking.x]\nurl = \" \"\n", BASE);
        assert!(parse(&text).is_err());
    }
}
