//! Seams to the trust, routing and ACL layers
//!
//! The relayer does not verify domain certificates or discover peers itself;
//! it asks a [`DomainRegistry`], a [`RoutingDirectory`] and an
//! [`AclService`]. The static implementations here are built from
//! configuration.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::codec::CommitPackage;
use crate::config::{ChainConfig, PeerConfig};
use crate::models::{AuthMsgWrapper, LedgerInfo};
use crate::types::Identity;

/// Blockchain metadata for a locally served domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMetadata {
    pub product: String,
    pub blockchain_id: String,
    pub am_contract: String,
}

pub trait DomainRegistry: Send + Sync {
    /// Whether this relayer holds the certificate for `domain`
    fn is_local_domain(&self, domain: &str) -> bool;

    fn metadata(&self, domain: &str) -> Option<DomainMetadata>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    /// Handshake with the peer completed
    Synced,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayerRoute {
    pub node_id: String,
    pub state: RouteState,
}

/// Ledger provenance travelling with a forwarded AM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedLedger {
    pub block_height: u64,
    pub block_hash: String,
    /// Unix seconds
    pub block_timestamp: i64,
    pub tx_id: String,
    pub index_in_block: i32,
}

impl From<&LedgerInfo> for ForwardedLedger {
    fn from(ledger: &LedgerInfo) -> Self {
        Self {
            block_height: ledger.block_height,
            block_hash: ledger.block_hash.clone(),
            block_timestamp: ledger.block_timestamp.timestamp(),
            tx_id: ledger.tx_id.clone(),
            index_in_block: ledger.index_in_block,
        }
    }
}

/// An AM handed to the relayer serving the receiver domain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    pub sender_domain: String,
    pub receiver_domain: String,
    /// Base64 of an encoded [`CommitPackage`]
    pub encoded_am: String,
    pub proof: String,
    pub ledger_info: ForwardedLedger,
}

impl ForwardRequest {
    pub fn new(
        sender_domain: &str,
        receiver_domain: &str,
        encoded_am: &[u8],
        proof: &[u8],
        ledger_info: ForwardedLedger,
    ) -> Self {
        let engine = base64::engine::general_purpose::STANDARD;
        Self {
            sender_domain: sender_domain.to_string(),
            receiver_domain: receiver_domain.to_string(),
            encoded_am: engine.encode(encoded_am),
            proof: engine.encode(proof),
            ledger_info,
        }
    }

    /// Rebuild the pending remote AM carried by this request
    pub fn to_auth_msg(&self) -> Result<AuthMsgWrapper> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&self.encoded_am)
            .wrap_err("encodedAm is not valid base64")?;
        let package = CommitPackage::decode(&raw).wrap_err("Undecodable forwarded package")?;
        if package.sender_domain != self.sender_domain {
            return Err(eyre!(
                "package sender domain {} does not match request sender domain {}",
                package.sender_domain,
                self.sender_domain
            ));
        }

        let ledger = &self.ledger_info;
        let block_timestamp = DateTime::<Utc>::from_timestamp(ledger.block_timestamp, 0)
            .ok_or_else(|| eyre!("invalid block timestamp {}", ledger.block_timestamp))?;
        Ok(AuthMsgWrapper::from_remote(
            &package.sender_domain,
            package.am,
            LedgerInfo {
                block_height: ledger.block_height,
                block_hash: ledger.block_hash.clone(),
                block_timestamp,
                tx_id: ledger.tx_id.clone(),
                index_in_block: ledger.index_in_block,
                capture_time: Utc::now(),
            },
        ))
    }
}

#[async_trait]
pub trait RoutingDirectory: Send + Sync {
    async fn route(&self, domain: &str) -> Result<Option<RelayerRoute>>;

    async fn forward_message(&self, route: &RelayerRoute, request: &ForwardRequest) -> Result<()>;
}

#[async_trait]
pub trait AclService: Send + Sync {
    async fn allowed(
        &self,
        sender_domain: &str,
        sender: &Identity,
        receiver_domain: &str,
        receiver: &Identity,
    ) -> Result<bool>;
}

/// Registry built from the managed chain list plus extra certified domains
#[derive(Debug, Clone, Default)]
pub struct StaticDomainRegistry {
    local: HashSet<String>,
    metadata: HashMap<String, DomainMetadata>,
}

impl StaticDomainRegistry {
    pub fn new(chains: &[ChainConfig], extra_local_domains: &[String]) -> Self {
        let mut registry = Self::default();
        for chain in chains {
            registry.local.insert(chain.domain.clone());
            registry.metadata.insert(
                chain.domain.clone(),
                DomainMetadata {
                    product: chain.product.clone(),
                    blockchain_id: chain.blockchain_id.clone(),
                    am_contract: chain.am_contract.clone(),
                },
            );
        }
        registry.local.extend(extra_local_domains.iter().cloned());
        registry
    }
}

impl DomainRegistry for StaticDomainRegistry {
    fn is_local_domain(&self, domain: &str) -> bool {
        self.local.contains(domain)
    }

    fn metadata(&self, domain: &str) -> Option<DomainMetadata> {
        self.metadata.get(domain).cloned()
    }
}

/// Allows everything except explicitly denied `sender:receiver` domain pairs
#[derive(Debug, Clone, Default)]
pub struct DenyListAcl {
    denied: HashSet<(String, String)>,
}

impl DenyListAcl {
    pub fn new(pairs: &[(String, String)]) -> Self {
        Self {
            denied: pairs.iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl AclService for DenyListAcl {
    async fn allowed(
        &self,
        sender_domain: &str,
        _sender: &Identity,
        receiver_domain: &str,
        _receiver: &Identity,
    ) -> Result<bool> {
        Ok(!self
            .denied
            .contains(&(sender_domain.to_string(), receiver_domain.to_string())))
    }
}

/// Static peer table; forwards over HTTP to `{url}/v1/am`
pub struct HttpRoutingDirectory {
    peers: HashMap<String, PeerConfig>,
    client: Client,
}

impl HttpRoutingDirectory {
    pub fn new(peers: &[PeerConfig], timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build HTTP client")?;
        Ok(Self {
            peers: peers.iter().map(|p| (p.domain.clone(), p.clone())).collect(),
            client,
        })
    }
}

#[async_trait]
impl RoutingDirectory for HttpRoutingDirectory {
    async fn route(&self, domain: &str) -> Result<Option<RelayerRoute>> {
        Ok(self.peers.get(domain).map(|p| RelayerRoute {
            node_id: p.node_id.clone(),
            state: if p.synced {
                RouteState::Synced
            } else {
                RouteState::Pending
            },
        }))
    }

    async fn forward_message(&self, route: &RelayerRoute, request: &ForwardRequest) -> Result<()> {
        let peer = self
            .peers
            .values()
            .find(|p| p.node_id == route.node_id)
            .ok_or_else(|| eyre!("no peer with node id {}", route.node_id))?;

        let response = self
            .client
            .post(format!("{}/v1/am", peer.url.trim_end_matches('/')))
            .json(request)
            .send()
            .await
            .wrap_err_with(|| format!("Failed to forward message to relayer {}", route.node_id))?;

        if !response.status().is_success() {
            return Err(eyre!(
                "relayer {} rejected forwarded message: HTTP {}",
                route.node_id,
                response.status()
            ));
        }
        Ok(())
    }
}
