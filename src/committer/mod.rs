//! Session-ordered commits of SDP messages to destination chains
//!
//! One pass of [`CommitterService::process`] peeks pending SDP messages for
//! a destination chain, groups them into sessions and commits each session
//! in its own task under a cluster-wide lock named after the session.
//! Ordered sessions are reconciled against the destination contract's next
//! expected sequence before anything is submitted.

use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::ActivityTracker;
use crate::chain::{ChainClient, ChainClientRegistry, SubmitReceipt};
use crate::codec::CommitPackage;
use crate::config::CommitterConfig;
use crate::db::MessagePool;
use crate::error::RelayerError;
use crate::lock::{with_lock, ClusterLock};
use crate::metrics;
use crate::models::SdpMsgWrapper;
use crate::types::{ChainKey, SdpMsgProcessState};

pub mod confirmation;
pub mod session;

pub use confirmation::TxConfirmationTask;
pub use session::{group_sessions, Session};

/// Counts for one commit pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub sessions: usize,
    /// Marked TX_SUCCESS without resubmission
    pub expired: usize,
    pub uploaded: usize,
    /// Ordered messages left pending behind a sequence gap
    pub gapped: usize,
    pub failed_sessions: usize,
}

impl CommitReport {
    fn add(&mut self, session: &SessionReport) {
        self.expired += session.expired;
        self.uploaded += session.uploaded;
        self.gapped += session.gapped;
    }
}

#[derive(Debug, Default)]
struct SessionReport {
    expired: usize,
    uploaded: usize,
    gapped: usize,
}

pub struct CommitterService {
    pool: Arc<dyn MessagePool>,
    clients: Arc<ChainClientRegistry>,
    lock: Arc<dyn ClusterLock>,
    activity: Arc<ActivityTracker>,
    workers: Arc<Semaphore>,
    config: CommitterConfig,
}

impl CommitterService {
    pub fn new(
        pool: Arc<dyn MessagePool>,
        clients: Arc<ChainClientRegistry>,
        lock: Arc<dyn ClusterLock>,
        activity: Arc<ActivityTracker>,
        config: CommitterConfig,
    ) -> Self {
        Self {
            pool,
            clients,
            lock,
            activity,
            workers: Arc::new(Semaphore::new(config.worker_pool_size)),
            config,
        }
    }

    /// Run one commit pass for `dest`
    pub async fn process(&self, dest: &ChainKey) -> Result<CommitReport> {
        let mut report = CommitReport::default();

        if self.activity.is_idle(dest) {
            debug!(chain = %dest, "No recent traffic, skipping commit pass");
            return Ok(report);
        }

        let client = self.clients.get(dest)?;

        let in_flight = self
            .pool
            .count_sdp_msgs(dest, SdpMsgProcessState::TxPending)
            .await
            .wrap_err_with(|| format!("Failed to count in-flight messages for {}", dest))?;
        metrics::set_pending_txs(dest, in_flight);
        if in_flight >= self.config.max_pending_per_chain {
            warn!(
                chain = %dest,
                in_flight,
                limit = self.config.max_pending_per_chain,
                "Too many unconfirmed transactions, skipping commit pass"
            );
            return Ok(report);
        }

        let pending = self
            .pool
            .peek_sdp_msgs(dest, SdpMsgProcessState::Pending, self.config.commit_batch_size)
            .await
            .wrap_err_with(|| format!("Failed to peek pending messages for {}", dest))?;
        if pending.is_empty() {
            self.activity.mark_idle(dest);
            return Ok(report);
        }

        let sessions = group_sessions(pending, self.config.worker_pool_size);
        report.sessions = sessions.len();

        let mut handles = Vec::with_capacity(sessions.len());
        for session in sessions {
            let committer = SessionCommitter {
                dest: dest.clone(),
                pool: self.pool.clone(),
                client: client.clone(),
                lock: self.lock.clone(),
                config: self.config.clone(),
            };
            let workers = self.workers.clone();
            let key = session.key.clone();
            let handle = tokio::spawn(async move {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .wrap_err("Commit worker pool closed")?;
                committer.commit(session).await
            });
            handles.push((key, handle));
        }

        // Bounded wait; a session still running past the deadline keeps its
        // lock and finishes on its own
        let deadline = Instant::now() + self.config.session_timeout();
        for (key, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(session))) => report.add(&session),
                Ok(Ok(Err(e))) => {
                    report.failed_sessions += 1;
                    metrics::record_error(&dest.to_string(), "session_commit");
                    error!(chain = %dest, session = %key, error = ?e, "Session commit failed");
                }
                Ok(Err(e)) => {
                    report.failed_sessions += 1;
                    error!(chain = %dest, session = %key, error = %e, "Session task panicked");
                }
                Err(_) => {
                    report.failed_sessions += 1;
                    warn!(chain = %dest, session = %key, "Session commit still running, no longer waiting");
                }
            }
        }

        if report.uploaded > 0 || report.expired > 0 {
            info!(
                chain = %dest,
                sessions = report.sessions,
                uploaded = report.uploaded,
                expired = report.expired,
                gapped = report.gapped,
                failed_sessions = report.failed_sessions,
                "Commit pass complete"
            );
        }
        Ok(report)
    }
}

/// Everything one session task needs, owned so it can run detached
struct SessionCommitter {
    dest: ChainKey,
    pool: Arc<dyn MessagePool>,
    client: Arc<dyn ChainClient>,
    lock: Arc<dyn ClusterLock>,
    config: CommitterConfig,
}

impl SessionCommitter {
    async fn commit(&self, session: Session) -> Result<SessionReport> {
        let key = session.key.clone();
        with_lock(self.lock.as_ref(), &key, self.config.lock_wait(), || {
            self.commit_locked(session)
        })
        .await
        .wrap_err_with(|| format!("Failed to commit session {} to {}", key, self.dest))
    }

    async fn commit_locked(&self, session: Session) -> Result<SessionReport> {
        let mut report = SessionReport::default();

        // Another process may have committed these between peek and lock
        let mut live = Vec::with_capacity(session.messages.len());
        for msg in &session.messages {
            match self.pool.get_sdp_msg_with_lock(msg.id).await? {
                Some(current) if current.process_state == SdpMsgProcessState::Pending => live.push(current),
                Some(current) => debug!(
                    session = %session.key,
                    sdp_id = current.id,
                    state = %current.process_state,
                    "Message no longer pending, dropping"
                ),
                None => return Err(RelayerError::MessageNotFound(msg.id).into()),
            }
        }
        if live.is_empty() {
            return Ok(report);
        }
        live.sort_by_key(|m| m.sequence);

        let (expired, upload) = if session.ordered {
            let (expired, upload, gapped) = self.reconcile(&session.key, live).await?;
            report.gapped = gapped;
            (expired, upload)
        } else {
            (Vec::new(), live)
        };

        for mut msg in expired {
            msg.process_state = SdpMsgProcessState::TxSuccess;
            msg.tx_success = Some(true);
            self.pool.update_sdp_msg(&msg).await?;
            metrics::record_sdp_commit(&self.dest, SdpMsgProcessState::TxSuccess.as_str());
            info!(
                session = %session.key,
                sdp_id = msg.id,
                sequence = msg.sequence,
                "Message already committed on chain, marked as success"
            );
            report.expired += 1;
        }

        for mut msg in upload {
            // Unordered buckets are not split the same way by every process
            if !session.ordered && !self.still_pending(&session.key, msg.id).await? {
                continue;
            }
            let receipt = self.submit(&msg).await?;
            apply_receipt(&mut msg, receipt);
            self.pool.update_sdp_msg(&msg).await?;
            metrics::record_sdp_commit(&self.dest, msg.process_state.as_str());
            info!(
                session = %session.key,
                sdp_id = msg.id,
                sequence = msg.sequence,
                tx_hash = msg.tx_hash.as_deref().unwrap_or_default(),
                state = %msg.process_state,
                "Message submitted"
            );
            report.uploaded += 1;

            // The contract did not take this sequence, later ones would fail
            if session.ordered && msg.process_state == SdpMsgProcessState::TxFailed {
                report_blocked_session(&self.dest, &session.key, &msg);
                break;
            }
        }
        Ok(report)
    }

    /// Split an ordered, sorted session into expired messages and the
    /// contiguous run starting at the contract's next expected sequence
    async fn reconcile(
        &self,
        key: &str,
        live: Vec<SdpMsgWrapper>,
    ) -> Result<(Vec<SdpMsgWrapper>, Vec<SdpMsgWrapper>, usize)> {
        let first = &live[0];
        let on_chain = self
            .client
            .query_on_chain_sequence(&first.sender_domain, &first.sender, &first.receiver_domain, &first.receiver)
            .await
            .wrap_err_with(|| format!("Failed to query on-chain sequence of session {}", key))?;

        let mut expected = on_chain;
        let mut expired = Vec::new();
        let mut upload = Vec::new();
        let mut gapped = 0;
        for msg in live {
            if msg.sequence < on_chain {
                expired.push(msg);
            } else if msg.sequence == expected {
                expected += 1;
                upload.push(msg);
            } else {
                if gapped == 0 {
                    warn!(
                        session = %key,
                        expected,
                        found = msg.sequence,
                        "Sequence gap, waiting for missing messages"
                    );
                }
                gapped += 1;
            }
        }
        Ok((expired, upload, gapped))
    }

    async fn still_pending(&self, key: &str, id: i64) -> Result<bool> {
        match self.pool.get_sdp_msg_with_lock(id).await? {
            Some(current) if current.process_state == SdpMsgProcessState::Pending => Ok(true),
            Some(current) => {
                debug!(
                    session = %key,
                    sdp_id = id,
                    state = %current.process_state,
                    "Message committed by another process, skipping"
                );
                Ok(false)
            }
            None => Err(RelayerError::MessageNotFound(id).into()),
        }
    }

    async fn submit(&self, msg: &SdpMsgWrapper) -> Result<SubmitReceipt> {
        let am = self
            .pool
            .get_auth_msg(msg.auth_msg_id)
            .await?
            .ok_or(RelayerError::MessageNotFound(msg.auth_msg_id))?;
        let package = CommitPackage {
            sender_domain: msg.sender_domain.clone(),
            am: am.to_auth_message(),
        };

        self.client
            .submit_package(&package.encode())
            .await
            .wrap_err_with(|| format!("Failed to submit SDP message {} (seq {})", msg.id, msg.sequence))
    }
}

/// A failed ordered message keeps the contract's next sequence where it is,
/// so every later message of its session stays pending until an operator
/// resolves it
pub(crate) fn report_blocked_session(dest: &ChainKey, key: &str, msg: &SdpMsgWrapper) {
    metrics::record_error(&dest.to_string(), "ordered_tx_failed");
    error!(
        chain = %dest,
        session = %key,
        sdp_id = msg.id,
        sequence = msg.sequence,
        tx_hash = msg.tx_hash.as_deref().unwrap_or_default(),
        reason = msg.fail_reason.as_deref().unwrap_or_default(),
        "Ordered message failed on chain, session blocked"
    );
}

fn apply_receipt(msg: &mut SdpMsgWrapper, receipt: SubmitReceipt) {
    msg.process_state = match (receipt.confirmed, receipt.success) {
        (false, _) => SdpMsgProcessState::TxPending,
        (true, true) => SdpMsgProcessState::TxSuccess,
        (true, false) => SdpMsgProcessState::TxFailed,
    };
    msg.tx_hash = Some(receipt.tx_id);
    msg.tx_success = receipt.confirmed.then_some(receipt.success);
    msg.fail_reason = receipt.error_message;
}
