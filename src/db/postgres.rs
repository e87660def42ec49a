use async_trait::async_trait;
use chrono::Utc;
use eyre::{Result, WrapErr};
use sqlx::postgres::PgPool;

use super::models::{AuthMsgRow, SdpMsgRow};
use super::{MessagePool, WatermarkStore};
use crate::models::{AnchorProcessHeights, AuthMsgWrapper, SdpMsgWrapper, Watermark, WatermarkName};
use crate::types::{AuthMsgProcessState, ChainKey, SdpMsgProcessState};

const AUTH_MSG_SELECT: &str = "id, product, blockchain_id, domain, am_client_contract, \
    correlation_id, version, msg_sender, protocol_type, trust_level, payload, block_height, \
    block_hash, block_timestamp, tx_id, index_in_block, capture_time, is_local, process_state";

const SDP_MSG_SELECT: &str = "id, auth_msg_id, version, msg_sequence, sender_domain, sender_id, \
    sender_product, sender_blockchain_id, receiver_domain, receiver_id, receiver_product, \
    receiver_blockchain_id, receiver_contract, payload, process_state, tx_hash, tx_success, \
    fail_reason";

/// Postgres-backed message pool
#[derive(Clone)]
pub struct PgMessagePool {
    pool: PgPool,
}

impl PgMessagePool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Insert a new AM, ignoring duplicates of the same ledger position
pub async fn insert_auth_msg(pool: &PgPool, msg: &AuthMsgWrapper) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO auth_msg_pool (product, blockchain_id, domain, am_client_contract,
            correlation_id, version, msg_sender, protocol_type, trust_level, payload,
            block_height, block_hash, block_timestamp, tx_id, index_in_block, capture_time,
            is_local, process_state)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT (domain, block_height, tx_id, index_in_block) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&msg.source.product)
    .bind(&msg.source.blockchain_id)
    .bind(&msg.source.domain)
    .bind(&msg.source.am_client_contract)
    .bind(&msg.correlation_id)
    .bind(msg.version as i32)
    .bind(msg.sender.0.as_slice())
    .bind(msg.protocol.to_u32() as i32)
    .bind(msg.trust_level.to_u8() as i16)
    .bind(&msg.payload)
    .bind(msg.ledger.block_height as i64)
    .bind(&msg.ledger.block_hash)
    .bind(msg.ledger.block_timestamp)
    .bind(&msg.ledger.tx_id)
    .bind(msg.ledger.index_in_block)
    .bind(msg.ledger.capture_time)
    .bind(msg.is_local)
    .bind(msg.process_state.as_str())
    .fetch_optional(pool)
    .await
    .wrap_err_with(|| format!("Failed to insert auth message from tx {}", msg.ledger.tx_id))?;

    Ok(row.map(|r| r.0))
}

pub async fn get_auth_msg(pool: &PgPool, id: i64) -> Result<Option<AuthMsgWrapper>> {
    let query = format!("SELECT {} FROM auth_msg_pool WHERE id = $1", AUTH_MSG_SELECT);
    let row = sqlx::query_as::<_, AuthMsgRow>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .wrap_err_with(|| format!("Failed to get auth message {}", id))?;

    Ok(row.map(AuthMsgWrapper::try_from).transpose()?)
}

/// Look up an AM by its ledger provenance
pub async fn find_auth_msg(pool: &PgPool, msg: &AuthMsgWrapper) -> Result<Option<AuthMsgWrapper>> {
    let query = format!(
        "SELECT {} FROM auth_msg_pool
         WHERE domain = $1 AND block_height = $2 AND tx_id = $3 AND index_in_block = $4",
        AUTH_MSG_SELECT
    );
    let row = sqlx::query_as::<_, AuthMsgRow>(&query)
        .bind(&msg.source.domain)
        .bind(msg.ledger.block_height as i64)
        .bind(&msg.ledger.tx_id)
        .bind(msg.ledger.index_in_block)
        .fetch_optional(pool)
        .await
        .wrap_err_with(|| format!("Failed to find auth message from tx {}", msg.ledger.tx_id))?;

    Ok(row.map(AuthMsgWrapper::try_from).transpose()?)
}

pub async fn get_pending_remote_auth_msgs(pool: &PgPool, limit: i64) -> Result<Vec<AuthMsgWrapper>> {
    let query = format!(
        "SELECT {} FROM auth_msg_pool
         WHERE is_local = FALSE AND process_state = 'PENDING'
         ORDER BY id ASC
         LIMIT $1",
        AUTH_MSG_SELECT
    );
    let rows = sqlx::query_as::<_, AuthMsgRow>(&query)
        .bind(limit)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get pending remote auth messages")?;

    rows.into_iter()
        .map(|r| AuthMsgWrapper::try_from(r).map_err(Into::into))
        .collect()
}

pub async fn get_pending_auth_msgs(pool: &PgPool, source: &ChainKey, limit: i64) -> Result<Vec<AuthMsgWrapper>> {
    let query = format!(
        "SELECT {} FROM auth_msg_pool
         WHERE product = $1 AND blockchain_id = $2 AND is_local AND process_state = 'PENDING'
         ORDER BY id ASC
         LIMIT $3",
        AUTH_MSG_SELECT
    );
    let rows = sqlx::query_as::<_, AuthMsgRow>(&query)
        .bind(&source.product)
        .bind(&source.blockchain_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get pending auth messages")?;

    rows.into_iter()
        .map(|r| AuthMsgWrapper::try_from(r).map_err(Into::into))
        .collect()
}

/// Conditional update: only a pending AM can be moved
pub async fn update_auth_msg(pool: &PgPool, msg: &AuthMsgWrapper) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE auth_msg_pool
        SET product = $2, blockchain_id = $3, am_client_contract = $4,
            process_state = $5, updated_at = NOW()
        WHERE id = $1 AND process_state = $6
        "#,
    )
    .bind(msg.id)
    .bind(&msg.source.product)
    .bind(&msg.source.blockchain_id)
    .bind(&msg.source.am_client_contract)
    .bind(msg.process_state.as_str())
    .bind(AuthMsgProcessState::Pending.as_str())
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to update auth message {}", msg.id))?;

    Ok(result.rows_affected() == 1)
}

pub async fn insert_sdp_msg(pool: &PgPool, msg: &SdpMsgWrapper) -> Result<i64> {
    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO sdp_msg_pool (auth_msg_id, version, msg_sequence, sender_domain, sender_id,
            sender_product, sender_blockchain_id, receiver_domain, receiver_id, receiver_product,
            receiver_blockchain_id, receiver_contract, payload, process_state, tx_hash,
            tx_success, fail_reason)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ON CONFLICT (auth_msg_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(msg.auth_msg_id)
    .bind(msg.version as i32)
    .bind(msg.sequence)
    .bind(&msg.sender_domain)
    .bind(msg.sender.0.as_slice())
    .bind(&msg.sender_product)
    .bind(&msg.sender_blockchain_id)
    .bind(&msg.receiver_domain)
    .bind(msg.receiver.0.as_slice())
    .bind(&msg.receiver_product)
    .bind(&msg.receiver_blockchain_id)
    .bind(&msg.receiver_contract)
    .bind(&msg.payload)
    .bind(msg.process_state.as_str())
    .bind(&msg.tx_hash)
    .bind(msg.tx_success)
    .bind(&msg.fail_reason)
    .fetch_optional(pool)
    .await
    .wrap_err_with(|| format!("Failed to insert sdp message for auth message {}", msg.auth_msg_id))?;

    if let Some((id,)) = inserted {
        return Ok(id);
    }

    let existing: (i64,) = sqlx::query_as(r#"SELECT id FROM sdp_msg_pool WHERE auth_msg_id = $1"#)
        .bind(msg.auth_msg_id)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to look up existing sdp message")?;
    Ok(existing.0)
}

pub async fn get_sdp_msgs(
    pool: &PgPool,
    receiver: &ChainKey,
    state: SdpMsgProcessState,
    limit: i64,
) -> Result<Vec<SdpMsgWrapper>> {
    let query = format!(
        "SELECT {} FROM sdp_msg_pool
         WHERE receiver_product = $1 AND receiver_blockchain_id = $2 AND process_state = $3
         ORDER BY id ASC
         LIMIT $4",
        SDP_MSG_SELECT
    );
    let rows = sqlx::query_as::<_, SdpMsgRow>(&query)
        .bind(&receiver.product)
        .bind(&receiver.blockchain_id)
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(pool)
        .await
        .wrap_err_with(|| format!("Failed to get {} sdp messages for {}", state, receiver))?;

    rows.into_iter()
        .map(|r| SdpMsgWrapper::try_from(r).map_err(Into::into))
        .collect()
}

pub async fn count_sdp_msgs(pool: &PgPool, receiver: &ChainKey, state: SdpMsgProcessState) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM sdp_msg_pool
        WHERE receiver_product = $1 AND receiver_blockchain_id = $2 AND process_state = $3
        "#,
    )
    .bind(&receiver.product)
    .bind(&receiver.blockchain_id)
    .bind(state.as_str())
    .fetch_one(pool)
    .await
    .wrap_err("Failed to count sdp messages")?;

    Ok(row.0)
}

/// Read an SDP row with `FOR UPDATE`, waiting out any writer mid-update
pub async fn get_sdp_msg_with_lock(pool: &PgPool, id: i64) -> Result<Option<SdpMsgWrapper>> {
    let mut tx = pool.begin().await.wrap_err("Failed to begin transaction")?;
    let query = format!("SELECT {} FROM sdp_msg_pool WHERE id = $1 FOR UPDATE", SDP_MSG_SELECT);
    let row = sqlx::query_as::<_, SdpMsgRow>(&query)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .wrap_err_with(|| format!("Failed to lock sdp message {}", id))?;
    tx.commit().await.wrap_err("Failed to commit transaction")?;

    Ok(row.map(SdpMsgWrapper::try_from).transpose()?)
}

pub async fn update_sdp_msg(pool: &PgPool, msg: &SdpMsgWrapper) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sdp_msg_pool
        SET receiver_product = $2, receiver_blockchain_id = $3, receiver_contract = $4,
            process_state = $5, tx_hash = $6, tx_success = $7, fail_reason = $8,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(msg.id)
    .bind(&msg.receiver_product)
    .bind(&msg.receiver_blockchain_id)
    .bind(&msg.receiver_contract)
    .bind(msg.process_state.as_str())
    .bind(&msg.tx_hash)
    .bind(msg.tx_success)
    .bind(&msg.fail_reason)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to update sdp message {}", msg.id))?;

    Ok(())
}

#[async_trait]
impl MessagePool for PgMessagePool {
    async fn insert_auth_msg(&self, msg: &AuthMsgWrapper) -> Result<Option<i64>> {
        insert_auth_msg(&self.pool, msg).await
    }

    async fn get_auth_msg(&self, id: i64) -> Result<Option<AuthMsgWrapper>> {
        get_auth_msg(&self.pool, id).await
    }

    async fn find_auth_msg(&self, msg: &AuthMsgWrapper) -> Result<Option<AuthMsgWrapper>> {
        find_auth_msg(&self.pool, msg).await
    }

    async fn peek_pending_auth_msgs(&self, source: &ChainKey, limit: i64) -> Result<Vec<AuthMsgWrapper>> {
        get_pending_auth_msgs(&self.pool, source, limit).await
    }

    async fn peek_pending_remote_auth_msgs(&self, limit: i64) -> Result<Vec<AuthMsgWrapper>> {
        get_pending_remote_auth_msgs(&self.pool, limit).await
    }

    async fn update_auth_msg(&self, msg: &AuthMsgWrapper) -> Result<bool> {
        update_auth_msg(&self.pool, msg).await
    }

    async fn insert_sdp_msg(&self, msg: &SdpMsgWrapper) -> Result<i64> {
        insert_sdp_msg(&self.pool, msg).await
    }

    async fn peek_sdp_msgs(
        &self,
        receiver: &ChainKey,
        state: SdpMsgProcessState,
        limit: i64,
    ) -> Result<Vec<SdpMsgWrapper>> {
        get_sdp_msgs(&self.pool, receiver, state, limit).await
    }

    async fn count_sdp_msgs(&self, receiver: &ChainKey, state: SdpMsgProcessState) -> Result<i64> {
        count_sdp_msgs(&self.pool, receiver, state).await
    }

    async fn get_sdp_msg_with_lock(&self, id: i64) -> Result<Option<SdpMsgWrapper>> {
        get_sdp_msg_with_lock(&self.pool, id).await
    }

    async fn update_sdp_msg(&self, msg: &SdpMsgWrapper) -> Result<()> {
        update_sdp_msg(&self.pool, msg).await
    }
}

/// Postgres-backed watermark storage
#[derive(Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn load(&self, chain: &ChainKey) -> Result<AnchorProcessHeights> {
        let rows: Vec<(String, i64, chrono::DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT task, height, updated_at FROM anchor_process_heights
            WHERE product = $1 AND blockchain_id = $2
            "#,
        )
        .bind(&chain.product)
        .bind(&chain.blockchain_id)
        .fetch_all(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to load watermarks for {}", chain))?;

        let mut heights = AnchorProcessHeights::new(chain.clone());
        for (task, height, modified) in rows {
            match WatermarkName::parse(&task) {
                Some(name) => {
                    heights.heights.insert(
                        name,
                        Watermark {
                            height: height as u64,
                            modified,
                        },
                    );
                }
                None => tracing::warn!(chain = %chain, task = %task, "Ignoring unknown watermark"),
            }
        }
        Ok(heights)
    }

    async fn save(&self, chain: &ChainKey, name: WatermarkName, height: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO anchor_process_heights (product, blockchain_id, task, height)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (product, blockchain_id, task) DO UPDATE
            SET height = GREATEST(anchor_process_heights.height, $4), updated_at = NOW()
            "#,
        )
        .bind(&chain.product)
        .bind(&chain.blockchain_id)
        .bind(name.as_key())
        .bind(height as i64)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to save {} watermark for {}", name, chain))?;

        Ok(())
    }
}
