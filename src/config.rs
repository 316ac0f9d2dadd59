//! Configuration module for WhaleGuard

use alloy_primitives::Address;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::utils::address::{checksum, parse_address};
use crate::utils::backoff::BackoffPolicy;

/// Per-chain defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPreset {
    pub key: &'static str,
    pub name: &'static str,
    pub chain_id: u64,
    pub rpc_url: &'static str,
    pub explorer: &'static str,
    pub defillama_prefix: &'static str,
}

pub const SUPPORTED_CHAINS: &[ChainPreset] = &[
    ChainPreset {
        key: "ethereum",
        name: "Ethereum",
        chain_id: 1,
        rpc_url: "https://rpc.ankr.com/eth",
        explorer: "https://etherscan.io",
        defillama_prefix: "ethereum",
    },
    ChainPreset {
        key: "bsc",
        name: "BNB Chain",
        chain_id: 56,
        rpc_url: "https://rpc.ankr.com/bsc",
        explorer: "https://bscscan.com",
        defillama_prefix: "bsc",
    },
    ChainPreset {
        key: "polygon",
        name: "Polygon",
        chain_id: 137,
        rpc_url: "https://rpc.ankr.com/polygon",
        explorer: "https://polygonscan.com",
        defillama_prefix: "polygon",
    },
    ChainPreset {
        key: "arbitrum",
        name: "Arbitrum One",
        chain_id: 42161,
        rpc_url: "https://rpc.ankr.com/arbitrum",
        explorer: "https://arbiscan.io",
        defillama_prefix: "arbitrum",
    },
    ChainPreset {
        key: "base",
        name: "Base",
        chain_id: 8453,
        rpc_url: "https://rpc.ankr.com/base",
        explorer: "https://basescan.org",
        defillama_prefix: "base",
    },
];

impl ChainPreset {
    pub fn lookup(key: &str) -> Option<&'static ChainPreset> {
        let key = key.trim().to_ascii_lowercase();
        SUPPORTED_CHAINS.iter().find(|c| c.key == key)
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Target
    pub token_address: Address,
    pub chain: &'static ChainPreset,
    pub rpc_url: String,

    // Alerting
    pub usd_threshold: Decimal,
    pub alert_on_mint_burn: bool,
    pub dispatch_max_attempts: u32,

    // Roster
    pub roster_size: usize,
    pub roster_refresh_interval: Duration,
    pub individual_holders_only: bool,
    pub static_exclusion_list: HashSet<Address>,
    pub whale_labels: HashMap<Address, String>,

    // Log polling
    pub poll_interval: Duration,
    pub confirmation_depth: u64,
    pub max_block_range: u64,
    pub replay_blocks: u64,

    // Dedup
    pub dedup_capacity: usize,
    pub dedup_window: Duration,

    // Pricing
    pub price_max_age: Duration,

    // Network
    pub backoff: BackoffPolicy,
    pub http_timeout: Duration,
    pub rpc_timeout: Duration,

    // API keys / Telegram
    pub chainbase_api_key: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    // Runtime
    pub state_db_path: String,
    pub dashboard_port: u16,
    pub status_print_interval: Duration,
}

impl Config {
    /// Load configuration from `.env` and the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let token_raw = get("TOKEN_ADDRESS").ok_or(ConfigError::Missing("TOKEN_ADDRESS"))?;
        let token_address =
            parse_address(&token_raw).ok_or_else(|| ConfigError::InvalidAddress {
                key: "TOKEN_ADDRESS",
                value: token_raw.clone(),
            })?;

        let chain_key = get("CHAIN").unwrap_or_else(|| "ethereum".to_string());
        let chain = ChainPreset::lookup(&chain_key)
            .ok_or_else(|| ConfigError::UnsupportedChain(chain_key.clone()))?;

        let usd_threshold: Decimal = parse_or(&get, "USD_THRESHOLD", Decimal::from(10_000))?;
        if usd_threshold.is_sign_negative() {
            return Err(ConfigError::InvalidValue {
                key: "USD_THRESHOLD",
                value: usd_threshold.to_string(),
            });
        }

        let roster_size: usize = parse_or(&get, "ROSTER_SIZE", 100)?;
        if roster_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ROSTER_SIZE",
                value: "0".to_string(),
            });
        }

        let dedup_capacity: usize = parse_or(&get, "DEDUP_CAPACITY", 10_000)?;
        if dedup_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DEDUP_CAPACITY",
                value: "0".to_string(),
            });
        }

        let max_block_range: u64 = parse_or(&get, "MAX_BLOCK_RANGE", 2_000)?;
        if max_block_range == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_BLOCK_RANGE",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            token_address,
            chain,
            rpc_url: get("RPC_URL").unwrap_or_else(|| chain.rpc_url.to_string()),

            usd_threshold,
            alert_on_mint_burn: parse_bool(&get, "ALERT_ON_MINT_BURN", false)?,
            dispatch_max_attempts: parse_or(&get, "DISPATCH_MAX_ATTEMPTS", 5u32)?.max(1),

            roster_size,
            roster_refresh_interval: Duration::from_secs(parse_or(
                &get,
                "ROSTER_REFRESH_SECS",
                1_800u64,
            )?
            .max(1)),
            individual_holders_only: parse_bool(&get, "INDIVIDUAL_HOLDERS_ONLY", false)?,
            static_exclusion_list: parse_address_list(&get, "STATIC_EXCLUSION_LIST")?,
            whale_labels: parse_labels(&get, "WHALE_LABELS")?,

            poll_interval: Duration::from_secs(parse_or(&get, "POLL_INTERVAL_SECS", 12u64)?.max(1)),
            confirmation_depth: parse_or(&get, "CONFIRMATION_DEPTH", 12)?,
            max_block_range,
            replay_blocks: parse_or(&get, "REPLAY_BLOCKS", 0)?,

            dedup_capacity,
            dedup_window: Duration::from_secs(parse_or(&get, "DEDUP_WINDOW_SECS", 3_600)?),

            price_max_age: Duration::from_secs(parse_or(&get, "PRICE_MAX_AGE_SECS", 60)?),

            backoff: BackoffPolicy::new(
                Duration::from_millis(parse_nonzero(&get, "BACKOFF_INITIAL_MS", 1_000)?),
                Duration::from_secs(parse_or(&get, "BACKOFF_MAX_SECS", 60)?),
            ),
            http_timeout: Duration::from_secs(parse_nonzero(&get, "HTTP_TIMEOUT_SECS", 10)?),
            rpc_timeout: Duration::from_secs(parse_nonzero(&get, "RPC_TIMEOUT_SECS", 30)?),

            chainbase_api_key: get("CHAINBASE_API_KEY"),
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: get("TELEGRAM_CHAT_ID"),

            state_db_path: get("STATE_DB_PATH").unwrap_or_else(|| "data/whaleguard.db".to_string()),
            dashboard_port: parse_or(&get, "DASHBOARD_PORT", 3000)?,
            status_print_interval: Duration::from_secs(parse_or(
                &get,
                "STATUS_PRINT_INTERVAL_SECS",
                300u64,
            )?
            .max(1)),
        })
    }

    pub fn telegram_enabled(&self) -> bool {
        self.telegram_bot_token.is_some() && self.telegram_chat_id.is_some()
    }

    /// Human-readable configuration with secrets masked
    pub fn summary(&self) -> String {
        let configured = |enabled: bool| if enabled { "configured" } else { "not configured" };
        format!(
            "token={} chain={} (id {}) rpc={} threshold=${} top_n={} refresh={}s poll={}s \
             confirmations={} individual_only={} exclusions={} chainbase={} telegram={}",
            checksum(&self.token_address),
            self.chain.name,
            self.chain.chain_id,
            mask_url(&self.rpc_url),
            self.usd_threshold,
            self.roster_size,
            self.roster_refresh_interval.as_secs(),
            self.poll_interval.as_secs(),
            self.confirmation_depth,
            self.individual_holders_only,
            self.static_exclusion_list.len(),
            configured(self.chainbase_api_key.is_some()),
            configured(self.telegram_enabled()),
        )
    }
}

/// Like [`parse_or`], but zero is rejected
fn parse_nonzero<G>(get: &G, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse_or(get, key, default)? {
        0 => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_string(),
        }),
        value => Ok(value),
    }
}

fn parse_or<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
        }),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key,
                value: raw.clone(),
            }),
        },
        None => Ok(default),
    }
}

fn parse_address_list<G>(get: &G, key: &'static str) -> Result<HashSet<Address>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(HashSet::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            parse_address(s).ok_or_else(|| ConfigError::InvalidAddress {
                key,
                value: s.to_string(),
            })
        })
        .collect()
}

fn parse_labels<G>(get: &G, key: &'static str) -> Result<HashMap<Address, String>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(HashMap::new());
    };
    let mut labels = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (addr, label) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key,
            value: pair.to_string(),
        })?;
        let addr = parse_address(addr).ok_or_else(|| ConfigError::InvalidAddress {
            key,
            value: addr.to_string(),
        })?;
        labels.insert(addr, label.trim().to_string());
    }
    Ok(labels)
}

/// Only show scheme and host of a URL. Path, query and userinfo can all carry API keys.
pub fn mask_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
            let host = authority.rsplit('@').next().unwrap_or(authority);
            format!("{}://{}/...", scheme, host)
        }
        None => "not configured".to_string(),
    }
}
