//! Authenticated message processing
//!
//! Drives each pooled AM from PENDING to PROVED (or REJECTED), decodes the
//! SDP message it carries, and either persists that message for the
//! committer of a locally served chain or forwards the AM to the relayer
//! serving the receiver domain.

use eyre::{Result, WrapErr};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::ActivityTracker;
use crate::codec::{CommitPackage, SdpMessage};
use crate::db::MessagePool;
use crate::error::{CodecError, RelayerError};
use crate::metrics;
use crate::models::{AuthMsgWrapper, SdpMsgWrapper};
use crate::network::{AclService, DomainRegistry, ForwardRequest, ForwardedLedger, RouteState, RoutingDirectory};
use crate::types::{AuthMsgProcessState, ChainKey, SdpMsgProcessState, UpperProtocol};

pub const REASON_EMPTY_RECEIVER_DOMAIN: &str = "empty receiver domain";
pub const REASON_MISSING_BLOCKCHAIN: &str = "blockchain supposed existed but not";
pub const REASON_ACL_REJECTED: &str = "msg rejected by ACL";
pub const REASON_UNKNOWN_RECEIVER_DOMAIN: &str = "unknown receiver domain";

/// What happened to one AM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmOutcome {
    /// Already PROVED or REJECTED; nothing done
    AlreadyProcessed,
    /// Remote AM already pooled
    Duplicate,
    /// SDP message stored for a local committer
    Local { sdp_id: i64 },
    Forwarded,
    Illegal,
    Rejected,
}

impl AmOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmOutcome::AlreadyProcessed => "already_processed",
            AmOutcome::Duplicate => "duplicate",
            AmOutcome::Local { .. } => "local",
            AmOutcome::Forwarded => "forwarded",
            AmOutcome::Illegal => "illegal",
            AmOutcome::Rejected => "rejected",
        }
    }
}

pub struct MessageProcessor {
    pool: Arc<dyn MessagePool>,
    domains: Arc<dyn DomainRegistry>,
    routing: Arc<dyn RoutingDirectory>,
    acl: Arc<dyn AclService>,
    activity: Arc<ActivityTracker>,
}

impl MessageProcessor {
    pub fn new(
        pool: Arc<dyn MessagePool>,
        domains: Arc<dyn DomainRegistry>,
        routing: Arc<dyn RoutingDirectory>,
        acl: Arc<dyn AclService>,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            pool,
            domains,
            routing,
            acl,
            activity,
        }
    }

    /// Process up to `limit` pending AMs extracted from `source`. Each AM
    /// is independent; failures are logged and left for the next pass.
    pub async fn process_pending(&self, source: &ChainKey, limit: i64) -> Result<usize> {
        let pending = self
            .pool
            .peek_pending_auth_msgs(source, limit)
            .await
            .wrap_err_with(|| format!("Failed to peek pending AMs of {}", source))?;

        Ok(self.process_each(&source.to_string(), pending).await)
    }

    /// Retry remote AMs left pending by a failed delivery
    pub async fn process_pending_remote(&self, limit: i64) -> Result<usize> {
        let pending = self
            .pool
            .peek_pending_remote_auth_msgs(limit)
            .await
            .wrap_err("Failed to peek pending remote AMs")?;

        Ok(self.process_each("remote", pending).await)
    }

    async fn process_each(&self, label: &str, pending: Vec<AuthMsgWrapper>) -> usize {
        let mut processed = 0;
        for am in pending {
            let (id, correlation_id) = (am.id, am.correlation_id.clone());
            let result = if am.is_local {
                self.process_local_am(am).await
            } else if is_pending(&am) {
                self.prove_and_route(am).await
            } else {
                Ok(AmOutcome::AlreadyProcessed)
            };
            match result {
                Ok(_) => processed += 1,
                Err(e) => {
                    metrics::record_error(label, "am_process");
                    error!(
                        chain = %label,
                        am_id = id,
                        correlation_id = %correlation_id,
                        error = ?e,
                        "Failed to process authenticated message"
                    );
                }
            }
        }
        processed
    }

    /// Whether AMs addressed to `domain` end on a chain this relayer serves
    pub fn serves_domain(&self, domain: &str) -> bool {
        self.domains.is_local_domain(domain)
    }

    /// Process an AM extracted from a managed chain
    pub async fn process_local_am(&self, mut am: AuthMsgWrapper) -> Result<AmOutcome> {
        if !is_pending(&am) {
            return Ok(AmOutcome::AlreadyProcessed);
        }

        // Fill in what extraction could not know
        if am.source.product.is_none() || am.source.blockchain_id.is_none() || am.source.am_client_contract.is_none() {
            if let Some(meta) = self.domains.metadata(&am.source.domain) {
                am.source.product.get_or_insert(meta.product);
                am.source.blockchain_id.get_or_insert(meta.blockchain_id);
                am.source.am_client_contract.get_or_insert(meta.am_contract);
            }
        }

        self.prove_and_route(am).await
    }

    /// Pool and process an AM received from a peer relayer
    pub async fn process_remote_am(&self, mut am: AuthMsgWrapper) -> Result<AmOutcome> {
        if !is_pending(&am) {
            return Ok(AmOutcome::AlreadyProcessed);
        }
        am.is_local = false;

        let inserted = self
            .pool
            .insert_auth_msg(&am)
            .await
            .wrap_err_with(|| format!("Failed to pool remote AM from {}", am.source.domain))?;
        match inserted {
            Some(id) => am.id = id,
            None => {
                // A redelivery of an AM whose first attempt failed picks up
                // the pooled row instead of being dropped
                match self.pool.find_auth_msg(&am).await? {
                    Some(existing) if existing.process_state == AuthMsgProcessState::Pending => {
                        debug!(
                            am_id = existing.id,
                            domain = %existing.source.domain,
                            "Remote AM already pooled but still pending, retrying"
                        );
                        am = existing;
                    }
                    _ => {
                        debug!(
                            domain = %am.source.domain,
                            tx_id = %am.ledger.tx_id,
                            "Remote AM already pooled"
                        );
                        return Ok(AmOutcome::Duplicate);
                    }
                }
            }
        }

        self.prove_and_route(am).await
    }

    async fn prove_and_route(&self, mut am: AuthMsgWrapper) -> Result<AmOutcome> {
        let chain_label = am
            .source
            .chain()
            .map(|c| c.to_string())
            .unwrap_or_else(|| am.source.domain.clone());

        let result = self.route(&mut am).await.wrap_err_with(|| {
            format!(
                "Failed to process AM {} (correlation {}) from {}",
                am.id, am.correlation_id, chain_label
            )
        });

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                // Unsupported protocols end the AM; anything else is retried
                if am.process_state == AuthMsgProcessState::Rejected {
                    self.commit_am_state(&am).await?;
                }
                return Err(e);
            }
        };

        self.commit_am_state(&am).await?;
        metrics::record_am_processed(&chain_label, outcome.as_str());
        info!(
            chain = %chain_label,
            am_id = am.id,
            correlation_id = %am.correlation_id,
            outcome = outcome.as_str(),
            "Authenticated message processed"
        );
        Ok(outcome)
    }

    async fn commit_am_state(&self, am: &AuthMsgWrapper) -> Result<()> {
        let updated = self
            .pool
            .update_auth_msg(am)
            .await
            .wrap_err_with(|| format!("Failed to update AM {} to {}", am.id, am.process_state))?;
        if !updated {
            warn!(
                am_id = am.id,
                correlation_id = %am.correlation_id,
                "AM was no longer pending when its result was stored"
            );
        }
        Ok(())
    }

    /// Decide where the SDP message of `am` goes. Sets the AM's final state
    /// in memory; the caller persists it.
    async fn route(&self, am: &mut AuthMsgWrapper) -> Result<AmOutcome> {
        if am.protocol != UpperProtocol::Sdp {
            am.process_state = AuthMsgProcessState::Rejected;
            return Err(RelayerError::UnsupportedProtocol(am.protocol.to_u32()).into());
        }

        let mut sdp = match self.parse_sdp_msg_from(am) {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(
                    am_id = am.id,
                    correlation_id = %am.correlation_id,
                    error = %e,
                    "Undecodable SDP payload, rejecting AM"
                );
                am.process_state = AuthMsgProcessState::Rejected;
                return Ok(AmOutcome::Illegal);
            }
        };
        am.process_state = AuthMsgProcessState::Proved;

        if sdp.process_state == SdpMsgProcessState::MsgIllegal {
            self.store_sdp(&sdp).await?;
            return Ok(AmOutcome::Illegal);
        }

        if !sdp.is_self_call() {
            let allowed = self
                .acl
                .allowed(&sdp.sender_domain, &sdp.sender, &sdp.receiver_domain, &sdp.receiver)
                .await
                .wrap_err("ACL check failed")?;
            if !allowed {
                sdp.set_terminal(SdpMsgProcessState::MsgRejected, REASON_ACL_REJECTED);
                self.store_sdp(&sdp).await?;
                return Ok(AmOutcome::Rejected);
            }
        }

        if let Some(receiver) = sdp.receiver_chain() {
            self.activity.mark_active(&receiver);
            let sdp_id = self.store_sdp(&sdp).await?;
            return Ok(AmOutcome::Local { sdp_id });
        }

        let route = self
            .routing
            .route(&sdp.receiver_domain)
            .await
            .wrap_err_with(|| format!("Failed to look up route to {}", sdp.receiver_domain))?;

        match route.filter(|r| r.state == RouteState::Synced) {
            Some(route) => {
                let package = CommitPackage {
                    sender_domain: am.source.domain.clone(),
                    am: am.to_auth_message(),
                };
                // Proofs are attached by the trust layer of the receiving
                // relayer; ledger info is enough to re-derive them
                let request = ForwardRequest::new(
                    &am.source.domain,
                    &sdp.receiver_domain,
                    &package.encode(),
                    &[],
                    ForwardedLedger::from(&am.ledger),
                );
                self.routing
                    .forward_message(&route, &request)
                    .await
                    .wrap_err_with(|| format!("Failed to forward AM to {}", sdp.receiver_domain))?;
                Ok(AmOutcome::Forwarded)
            }
            None => {
                sdp.set_terminal(SdpMsgProcessState::MsgRejected, REASON_UNKNOWN_RECEIVER_DOMAIN);
                self.store_sdp(&sdp).await?;
                Ok(AmOutcome::Rejected)
            }
        }
    }

    /// Decode the SDP message of a proved AM and resolve its receiver
    pub fn parse_sdp_msg_from(&self, am: &AuthMsgWrapper) -> Result<SdpMsgWrapper, CodecError> {
        let decoded = SdpMessage::decode(&am.payload)?;
        let mut sdp = SdpMsgWrapper::new(am, decoded);

        if sdp.receiver_domain.is_empty() {
            sdp.set_terminal(SdpMsgProcessState::MsgIllegal, REASON_EMPTY_RECEIVER_DOMAIN);
            return Ok(sdp);
        }

        if self.domains.is_local_domain(&sdp.receiver_domain) {
            match self.domains.metadata(&sdp.receiver_domain) {
                Some(meta) => {
                    sdp.receiver_product = Some(meta.product);
                    sdp.receiver_blockchain_id = Some(meta.blockchain_id);
                    sdp.receiver_contract = Some(meta.am_contract);
                }
                None => sdp.set_terminal(SdpMsgProcessState::MsgIllegal, REASON_MISSING_BLOCKCHAIN),
            }
        }
        Ok(sdp)
    }

    async fn store_sdp(&self, sdp: &SdpMsgWrapper) -> Result<i64> {
        self.pool
            .insert_sdp_msg(sdp)
            .await
            .wrap_err_with(|| format!("Failed to store SDP message of AM {}", sdp.auth_msg_id))
    }
}

fn is_pending(am: &AuthMsgWrapper) -> bool {
    match am.process_state {
        AuthMsgProcessState::Pending => true,
        AuthMsgProcessState::Proved | AuthMsgProcessState::Rejected => {
            debug!(am_id = am.id, state = %am.process_state, "AM already processed, skipping");
            false
        }
    }
}
