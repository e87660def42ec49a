//! Message pool and watermark persistence
//!
//! The pipeline stages only see the [`MessagePool`] and [`WatermarkStore`]
//! traits. Production wiring uses the Postgres implementations in
//! [`postgres`]; single-node runs and tests use [`memory`].

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::models::{AnchorProcessHeights, AuthMsgWrapper, SdpMsgWrapper, WatermarkName};
use crate::types::{ChainKey, SdpMsgProcessState};

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::{MemoryMessagePool, MemoryWatermarkStore};
pub use postgres::{PgMessagePool, PgWatermarkStore};

/// Create a database connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Storage of authenticated and SDP messages
#[async_trait]
pub trait MessagePool: Send + Sync {
    /// Insert a pending AM. Returns `None` when a message with the same
    /// ledger provenance is already pooled.
    async fn insert_auth_msg(&self, msg: &AuthMsgWrapper) -> Result<Option<i64>>;

    async fn get_auth_msg(&self, id: i64) -> Result<Option<AuthMsgWrapper>>;

    /// The pooled AM with the same ledger provenance as `msg`
    async fn find_auth_msg(&self, msg: &AuthMsgWrapper) -> Result<Option<AuthMsgWrapper>>;

    /// Oldest pending AMs extracted from `source`
    async fn peek_pending_auth_msgs(&self, source: &ChainKey, limit: i64) -> Result<Vec<AuthMsgWrapper>>;

    /// Oldest pending AMs received from peer relayers
    async fn peek_pending_remote_auth_msgs(&self, limit: i64) -> Result<Vec<AuthMsgWrapper>>;

    /// Move a pending AM to its new state. Returns false if the row was no
    /// longer pending.
    async fn update_auth_msg(&self, msg: &AuthMsgWrapper) -> Result<bool>;

    /// Insert an SDP message, or return the id of the row already recorded
    /// for the same AM.
    async fn insert_sdp_msg(&self, msg: &SdpMsgWrapper) -> Result<i64>;

    /// Oldest SDP messages in `state` addressed to `receiver`
    async fn peek_sdp_msgs(
        &self,
        receiver: &ChainKey,
        state: SdpMsgProcessState,
        limit: i64,
    ) -> Result<Vec<SdpMsgWrapper>>;

    async fn count_sdp_msgs(&self, receiver: &ChainKey, state: SdpMsgProcessState) -> Result<i64>;

    /// Current persisted row, read under a row lock
    async fn get_sdp_msg_with_lock(&self, id: i64) -> Result<Option<SdpMsgWrapper>>;

    async fn update_sdp_msg(&self, msg: &SdpMsgWrapper) -> Result<()>;
}

/// Durable storage behind the watermark cache
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self, chain: &ChainKey) -> Result<AnchorProcessHeights>;

    /// Persist `height` unless a higher value is already stored
    async fn save(&self, chain: &ChainKey, name: WatermarkName, height: u64) -> Result<()>;
}
