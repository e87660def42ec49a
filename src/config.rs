use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::types::ChainKey;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    /// Unset means single-node mode with in-memory stores
    pub database: Option<DatabaseConfig>,
    pub api_port: u16,
    pub poll_interval_ms: u64,
    pub watermark_flush_interval_ms: u64,
    pub anchor: AnchorConfig,
    pub committer: CommitterConfig,
    pub chains: Vec<ChainConfig>,
    pub peers: Vec<PeerConfig>,
    /// Denied `(sender domain, receiver domain)` pairs
    pub acl_deny: Vec<(String, String)>,
    /// Domains this relayer holds certificates for without serving a chain yet
    pub extra_local_domains: Vec<String>,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Block polling, sync and notify tuning
#[derive(Debug, Clone)]
pub struct AnchorConfig {
    pub sync_batch_size: u64,
    pub sync_async_query_size: u64,
    pub max_diff_between_sync_and_notify: u64,
    pub notify_batch_size: u64,
    pub block_queue_capacity: usize,
    pub block_fetch_timeout_ms: u64,
}

impl AnchorConfig {
    pub fn block_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.block_fetch_timeout_ms)
    }
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            sync_batch_size: default_sync_batch_size(),
            sync_async_query_size: default_sync_async_query_size(),
            max_diff_between_sync_and_notify: default_max_diff_between_sync_and_notify(),
            notify_batch_size: default_notify_batch_size(),
            block_queue_capacity: default_block_queue_capacity(),
            block_fetch_timeout_ms: default_block_fetch_timeout(),
        }
    }
}

/// Committer tuning
#[derive(Debug, Clone)]
pub struct CommitterConfig {
    pub commit_batch_size: i64,
    pub max_pending_per_chain: i64,
    pub worker_pool_size: usize,
    pub session_timeout_ms: u64,
    pub lock_wait_ms: u64,
    pub idle_ttl_secs: u64,
}

impl CommitterConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            commit_batch_size: default_commit_batch_size(),
            max_pending_per_chain: default_max_pending_per_chain(),
            worker_pool_size: default_worker_pool_size(),
            session_timeout_ms: default_session_timeout(),
            lock_wait_ms: default_lock_wait(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

/// One managed blockchain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub product: String,
    pub blockchain_id: String,
    pub domain: String,
    pub plugin_url: String,
    pub am_contract: String,
}

impl ChainConfig {
    pub fn key(&self) -> ChainKey {
        ChainKey::new(self.product.clone(), self.blockchain_id.clone())
    }
}

/// A peer relayer serving remote domains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub domain: String,
    pub node_id: String,
    pub url: String,
    pub synced: bool,
}

/// Default functions
fn default_api_port() -> u16 {
    9090
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_watermark_flush_interval() -> u64 {
    5000
}

fn default_sync_batch_size() -> u64 {
    32
}

fn default_sync_async_query_size() -> u64 {
    8
}

fn default_max_diff_between_sync_and_notify() -> u64 {
    256
}

fn default_notify_batch_size() -> u64 {
    32
}

fn default_block_queue_capacity() -> usize {
    512
}

fn default_block_fetch_timeout() -> u64 {
    10_000
}

fn default_commit_batch_size() -> i64 {
    64
}

fn default_max_pending_per_chain() -> i64 {
    128
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_session_timeout() -> u64 {
    60_000
}

fn default_lock_wait() -> u64 {
    3_000
}

fn default_idle_ttl() -> u64 {
    10
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let database = env::var("DATABASE_URL").ok().map(|url| DatabaseConfig {
            url,
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
        });

        let anchor = AnchorConfig {
            sync_batch_size: env_or("SYNC_BATCH_SIZE", default_sync_batch_size()),
            sync_async_query_size: env_or("SYNC_ASYNC_QUERY_SIZE", default_sync_async_query_size()),
            max_diff_between_sync_and_notify: env_or(
                "MAX_DIFF_BETWEEN_SYNC_AND_NOTIFY",
                default_max_diff_between_sync_and_notify(),
            ),
            notify_batch_size: env_or("NOTIFY_BATCH_SIZE", default_notify_batch_size()),
            block_queue_capacity: env_or("BLOCK_QUEUE_CAPACITY", default_block_queue_capacity()),
            block_fetch_timeout_ms: env_or("BLOCK_FETCH_TIMEOUT_MS", default_block_fetch_timeout()),
        };

        let committer = CommitterConfig {
            commit_batch_size: env_or("COMMIT_BATCH_SIZE", default_commit_batch_size()),
            max_pending_per_chain: env_or("MAX_PENDING_PER_CHAIN", default_max_pending_per_chain()),
            worker_pool_size: env_or("COMMIT_WORKER_POOL_SIZE", default_worker_pool_size()),
            session_timeout_ms: env_or("SESSION_TIMEOUT_MS", default_session_timeout()),
            lock_wait_ms: env_or("LOCK_WAIT_MS", default_lock_wait()),
            idle_ttl_secs: env_or("IDLE_TTL_SECS", default_idle_ttl()),
        };

        let config = Config {
            database,
            api_port: env_or("API_PORT", default_api_port()),
            poll_interval_ms: env_or("POLL_INTERVAL_MS", default_poll_interval()),
            watermark_flush_interval_ms: env_or(
                "WATERMARK_FLUSH_INTERVAL_MS",
                default_watermark_flush_interval(),
            ),
            anchor,
            committer,
            chains: load_chains_from_env()?,
            peers: load_peers_from_env()?,
            acl_deny: env::var("ACL_DENY")
                .map(|v| parse_acl_deny(&v))
                .unwrap_or_else(|_| Ok(Vec::new()))?,
            extra_local_domains: env::var("EXTRA_LOCAL_DOMAINS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watermark_flush_interval(&self) -> Duration {
        Duration::from_millis(self.watermark_flush_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(db) = &self.database {
            if db.url.is_empty() {
                return Err(eyre!("database.url cannot be empty"));
            }
        }

        if self.chains.is_empty() {
            return Err(eyre!("at least one chain must be configured (CHAINS_COUNT)"));
        }

        let a = &self.anchor;
        if a.sync_batch_size == 0 || a.sync_async_query_size == 0 || a.notify_batch_size == 0 {
            return Err(eyre!("sync and notify batch sizes must be positive"));
        }
        if a.max_diff_between_sync_and_notify == 0 {
            return Err(eyre!("MAX_DIFF_BETWEEN_SYNC_AND_NOTIFY must be positive"));
        }
        // The queue has to hold everything sync may run ahead of notify
        if (a.block_queue_capacity as u64) < a.max_diff_between_sync_and_notify {
            return Err(eyre!(
                "BLOCK_QUEUE_CAPACITY ({}) must be at least MAX_DIFF_BETWEEN_SYNC_AND_NOTIFY ({})",
                a.block_queue_capacity,
                a.max_diff_between_sync_and_notify
            ));
        }

        let c = &self.committer;
        if c.commit_batch_size <= 0 || c.max_pending_per_chain <= 0 || c.worker_pool_size == 0 {
            return Err(eyre!("committer batch size, pending limit and pool size must be positive"));
        }

        for (i, chain) in self.chains.iter().enumerate() {
            if chain.domain.is_empty() {
                return Err(eyre!("chain {} has an empty domain", i + 1));
            }
            let dup = self.chains[..i]
                .iter()
                .any(|c| c.key() == chain.key() || c.domain == chain.domain);
            if dup {
                return Err(eyre!(
                    "chain {} ({}) is configured twice; duplicate anchors would race on the same watermarks",
                    chain.key(),
                    chain.domain
                ));
            }
        }

        for peer in &self.peers {
            if self.chains.iter().any(|c| c.domain == peer.domain) {
                return Err(eyre!(
                    "domain {} is both served locally and routed to peer {}",
                    peer.domain,
                    peer.node_id
                ));
            }
        }

        Ok(())
    }
}

/// Load managed chains from `CHAINS_COUNT` and `CHAIN_{i}_*`
fn load_chains_from_env() -> Result<Vec<ChainConfig>> {
    let count: usize = env::var("CHAINS_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let mut chains = Vec::with_capacity(count);
    for i in 1..=count {
        let prefix = format!("CHAIN_{}", i);
        let required = |field: &str| {
            env::var(format!("{}_{}", prefix, field))
                .map_err(|_| eyre!("Missing {}_{}", prefix, field))
        };

        chains.push(ChainConfig {
            product: required("PRODUCT")?,
            blockchain_id: required("BLOCKCHAIN_ID")?,
            domain: required("DOMAIN")?,
            plugin_url: required("PLUGIN_URL")?,
            am_contract: env::var(format!("{}_AM_CONTRACT", prefix)).unwrap_or_default(),
        });
    }
    Ok(chains)
}

/// Load peer relayers from `PEERS_COUNT` and `PEER_{i}_*`
fn load_peers_from_env() -> Result<Vec<PeerConfig>> {
    let count: usize = env::var("PEERS_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let mut peers = Vec::with_capacity(count);
    for i in 1..=count {
        let prefix = format!("PEER_{}", i);
        let domain = env::var(format!("{}_DOMAIN", prefix))
            .map_err(|_| eyre!("Missing {}_DOMAIN", prefix))?;
        let url = env::var(format!("{}_URL", prefix)).map_err(|_| eyre!("Missing {}_URL", prefix))?;

        peers.push(PeerConfig {
            node_id: env::var(format!("{}_NODE_ID", prefix)).unwrap_or_else(|_| format!("peer_{}", i)),
            synced: env::var(format!("{}_SYNCED", prefix))
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
            domain,
            url,
        });
    }
    Ok(peers)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `a.dom:b.dom,c.dom:d.dom`
fn parse_acl_deny(raw: &str) -> Result<Vec<(String, String)>> {
    parse_list(raw)
        .into_iter()
        .map(|pair| {
            let (sender, receiver) = pair
                .split_once(':')
                .ok_or_else(|| eyre!("Invalid ACL_DENY entry '{}', expected sender:receiver", pair))?;
            Ok((sender.to_string(), receiver.to_string()))
        })
        .collect()
}
