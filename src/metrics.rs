//! Prometheus metrics for the AM relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec};

use crate::types::ChainKey;

lazy_static! {
    // Anchor metrics
    pub static ref WATERMARK: GaugeVec = register_gauge_vec!(
        "am_relayer_watermark",
        "Current height of each watermark",
        &["chain", "watermark"]
    ).unwrap();

    pub static ref BLOCKS_SYNCED: CounterVec = register_counter_vec!(
        "am_relayer_blocks_synced_total",
        "Total number of blocks fetched and queued",
        &["chain"]
    ).unwrap();

    pub static ref BLOCK_QUEUE_SIZE: GaugeVec = register_gauge_vec!(
        "am_relayer_block_queue_size",
        "Blocks waiting in the block queue",
        &["chain"]
    ).unwrap();

    // Message metrics
    pub static ref AMS_EXTRACTED: CounterVec = register_counter_vec!(
        "am_relayer_auth_msgs_extracted_total",
        "Total number of authenticated messages extracted from blocks",
        &["chain"]
    ).unwrap();

    pub static ref AMS_PROCESSED: CounterVec = register_counter_vec!(
        "am_relayer_auth_msgs_processed_total",
        "Authenticated messages processed, by SDP outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref SDP_COMMITS: CounterVec = register_counter_vec!(
        "am_relayer_sdp_commits_total",
        "SDP messages committed to destination chains, by resulting state",
        &["chain", "state"]
    ).unwrap();

    pub static ref PENDING_TXS: GaugeVec = register_gauge_vec!(
        "am_relayer_pending_txs",
        "SDP messages in TX_PENDING per destination chain",
        &["chain"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "am_relayer_errors_total",
        "Total number of errors",
        &["chain", "type"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "am_relayer_consecutive_failures",
        "Number of consecutive failures (circuit breaker)",
        &["chain", "stage"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "am_relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();
}

pub fn set_watermark(chain: &ChainKey, watermark: &str, height: u64) {
    WATERMARK
        .with_label_values(&[chain.to_string().as_str(), watermark])
        .set(height as f64);
}

pub fn record_blocks_synced(chain: &ChainKey, count: usize) {
    BLOCKS_SYNCED
        .with_label_values(&[chain.to_string().as_str()])
        .inc_by(count as f64);
}

pub fn set_block_queue_size(chain: &ChainKey, size: usize) {
    BLOCK_QUEUE_SIZE
        .with_label_values(&[chain.to_string().as_str()])
        .set(size as f64);
}

pub fn record_am_extracted(chain: &ChainKey) {
    AMS_EXTRACTED.with_label_values(&[chain.to_string().as_str()]).inc();
}

/// Record how an AM ended up: `local`, `forwarded`, `illegal`, `rejected`
pub fn record_am_processed(chain: &str, outcome: &str) {
    AMS_PROCESSED.with_label_values(&[chain, outcome]).inc();
}

pub fn record_sdp_commit(chain: &ChainKey, state: &str) {
    SDP_COMMITS
        .with_label_values(&[chain.to_string().as_str(), state])
        .inc();
}

pub fn set_pending_txs(chain: &ChainKey, count: i64) {
    PENDING_TXS
        .with_label_values(&[chain.to_string().as_str()])
        .set(count as f64);
}

/// Record an error
pub fn record_error(chain: &str, error_type: &str) {
    ERRORS.with_label_values(&[chain, error_type]).inc();
}

/// Update consecutive failures (circuit breaker)
pub fn set_consecutive_failures(chain: &ChainKey, stage: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[chain.to_string().as_str(), stage])
        .set(count as f64);
}
