use eyre::{Result, WrapErr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{ChainClientRegistry, TxStatus};
use crate::db::MessagePool;
use crate::metrics;
use crate::types::{ChainKey, SdpMsgProcessState};

/// Settles TX_PENDING messages once their transaction is final
pub struct TxConfirmationTask {
    pool: Arc<dyn MessagePool>,
    clients: Arc<ChainClientRegistry>,
    batch_size: i64,
}

impl TxConfirmationTask {
    pub fn new(pool: Arc<dyn MessagePool>, clients: Arc<ChainClientRegistry>, batch_size: i64) -> Self {
        Self {
            pool,
            clients,
            batch_size,
        }
    }

    /// Check every in-flight transaction on `dest` once. Returns how many
    /// messages reached a final state.
    pub async fn process(&self, dest: &ChainKey) -> Result<usize> {
        let client = self.clients.get(dest)?;
        let pending = self
            .pool
            .peek_sdp_msgs(dest, SdpMsgProcessState::TxPending, self.batch_size)
            .await
            .wrap_err_with(|| format!("Failed to peek in-flight messages for {}", dest))?;

        let mut settled = 0;
        for candidate in pending {
            let Some(tx_hash) = candidate.tx_hash.clone() else {
                warn!(chain = %dest, sdp_id = candidate.id, "In-flight message has no tx hash");
                continue;
            };

            let result = match client.query_tx_result(&tx_hash).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(chain = %dest, tx_hash = %tx_hash, error = %e, "Failed to query transaction");
                    continue;
                }
            };

            let state = match result.status {
                TxStatus::Pending => {
                    debug!(chain = %dest, tx_hash = %tx_hash, "Transaction not final yet");
                    continue;
                }
                TxStatus::Success => SdpMsgProcessState::TxSuccess,
                TxStatus::Failed => SdpMsgProcessState::TxFailed,
            };

            // The committer or another process may have settled it already
            let Some(mut msg) = self.pool.get_sdp_msg_with_lock(candidate.id).await? else {
                continue;
            };
            if msg.process_state != SdpMsgProcessState::TxPending {
                continue;
            }

            msg.process_state = state;
            msg.tx_success = Some(state == SdpMsgProcessState::TxSuccess);
            msg.fail_reason = result.error_message;
            self.pool.update_sdp_msg(&msg).await?;
            metrics::record_sdp_commit(dest, state.as_str());
            if state == SdpMsgProcessState::TxFailed && !msg.is_unordered() {
                super::report_blocked_session(dest, &msg.session_key(), &msg);
            }
            info!(
                chain = %dest,
                sdp_id = msg.id,
                tx_hash = %tx_hash,
                state = %state,
                "Transaction settled"
            );
            settled += 1;
        }

        let in_flight = self
            .pool
            .count_sdp_msgs(dest, SdpMsgProcessState::TxPending)
            .await?;
        metrics::set_pending_txs(dest, in_flight);
        Ok(settled)
    }
}
