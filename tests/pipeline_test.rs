//! End-to-end pipeline tests
//!
//! Run with: cargo test --test pipeline_test
//!
//! The in-memory tests need nothing external. The Postgres test is ignored
//! by default; run it with DATABASE_URL set:
//! cargo test --test pipeline_test -- --ignored

use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use am_relayer::anchor::WatermarkCache;
use am_relayer::chain::{ChainClient, ChainClientRegistry, SubmitReceipt, TxResult, TxStatus};
use am_relayer::codec::{AuthMessage, CommitPackage, SdpMessage, AM_VERSION, SDP_VERSION};
use am_relayer::config::{AnchorConfig, ChainConfig, CommitterConfig, Config};
use am_relayer::db::{MemoryMessagePool, MemoryWatermarkStore};
use am_relayer::lock::LocalLock;
use am_relayer::models::{Block, CrossChainMessage};
use am_relayer::network::{DenyListAcl, HttpRoutingDirectory, StaticDomainRegistry};
use am_relayer::runner::{Runner, RunnerDeps};
use am_relayer::types::{ChainKey, Identity, NotifyTaskType, SdpMsgProcessState, TrustLevel, UpperProtocol};

mod helpers {
    use super::*;

    pub const SENDER: Identity = Identity([0x11; 32]);
    pub const RECEIVER: Identity = Identity([0x22; 32]);

    #[derive(Default)]
    struct State {
        height: u64,
        blocks: HashMap<u64, Block>,
        next_sequence: HashMap<i64, i64>,
        submitted: Vec<CommitPackage>,
    }

    /// Chain with a fixed block history that accepts every package
    pub struct ScriptedChain {
        chain: ChainKey,
        state: Mutex<State>,
    }

    impl ScriptedChain {
        pub fn new(chain: ChainKey) -> Self {
            Self {
                chain,
                state: Mutex::new(State::default()),
            }
        }

        /// Put one AM carrying an SDP message for `receiver_domain` at `height`
        pub fn emit(&self, height: u64, receiver_domain: &str, sequence: i64) {
            let sdp = SdpMessage {
                version: SDP_VERSION,
                receiver_domain: receiver_domain.to_string(),
                receiver: RECEIVER,
                sequence,
                message: format!("hello {}", sequence).into_bytes(),
            };
            let am = AuthMessage {
                version: AM_VERSION,
                sender: SENDER,
                protocol: UpperProtocol::Sdp,
                trust_level: TrustLevel::Zero,
                payload: sdp.encode(),
            };

            let mut state = self.state.lock().unwrap();
            state.height = state.height.max(height);
            let chain = self.chain.clone();
            let block = state.blocks.entry(height).or_insert_with(|| {
                let mut block = Block::empty(chain, height);
                block.hash = format!("0x{:064x}", height);
                block
            });
            let index = block.messages.len() as i32;
            block.messages.push(CrossChainMessage {
                tx_id: format!("0xtx{}-{}", height, index),
                index_in_block: index,
                raw_am: am.encode(),
            });
        }

        pub fn set_height(&self, height: u64) {
            self.state.lock().unwrap().height = height;
        }

        /// Sequences of the SDP messages committed here, in submission order
        pub fn committed_sequences(&self) -> Vec<i64> {
            self.state
                .lock()
                .unwrap()
                .submitted
                .iter()
                .map(|p| SdpMessage::decode(&p.am.payload).map(|s| s.sequence).unwrap_or(-2))
                .collect()
        }

        pub fn committed(&self) -> Vec<CommitPackage> {
            self.state.lock().unwrap().submitted.clone()
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedChain {
        async fn last_block_height(&self) -> Result<u64> {
            Ok(self.state.lock().unwrap().height)
        }

        async fn block_at_height(&self, height: u64) -> Result<Block> {
            let state = self.state.lock().unwrap();
            if height > state.height {
                return Err(eyre!("block {} not produced yet", height));
            }
            Ok(state
                .blocks
                .get(&height)
                .cloned()
                .unwrap_or_else(|| Block::empty(self.chain.clone(), height)))
        }

        async fn is_contract_deployed(&self, _task: NotifyTaskType) -> Result<bool> {
            Ok(true)
        }

        async fn submit_package(&self, package: &[u8]) -> Result<SubmitReceipt> {
            let package = CommitPackage::decode(package)?;
            let sdp = SdpMessage::decode(&package.am.payload)?;
            let mut state = self.state.lock().unwrap();
            let expected = state.next_sequence.get(&0).copied().unwrap_or(0);
            if !sdp.is_unordered() {
                if sdp.sequence != expected {
                    return Err(eyre!("sequence {} out of order, expected {}", sdp.sequence, expected));
                }
                state.next_sequence.insert(0, expected + 1);
            }
            state.submitted.push(package);
            Ok(SubmitReceipt {
                tx_id: format!("0xcommit{}", state.submitted.len()),
                confirmed: true,
                success: true,
                error_message: None,
            })
        }

        async fn query_on_chain_sequence(
            &self,
            _sender_domain: &str,
            _sender: &Identity,
            _receiver_domain: &str,
            _receiver: &Identity,
        ) -> Result<i64> {
            // Single session per test
            Ok(self.state.lock().unwrap().next_sequence.get(&0).copied().unwrap_or(0))
        }

        async fn query_tx_result(&self, _tx_id: &str) -> Result<TxResult> {
            Ok(TxResult {
                status: TxStatus::Success,
                error_message: None,
            })
        }
    }

    pub fn chain_config(product: &str, blockchain_id: &str, domain: &str) -> ChainConfig {
        ChainConfig {
            product: product.to_string(),
            blockchain_id: blockchain_id.to_string(),
            domain: domain.to_string(),
            plugin_url: "http://127.0.0.1:1".to_string(),
            am_contract: format!("0x{}am", product),
        }
    }

    pub fn config(chains: Vec<ChainConfig>, acl_deny: Vec<(String, String)>) -> Config {
        Config {
            database: None,
            api_port: 0,
            poll_interval_ms: 10,
            watermark_flush_interval_ms: 50,
            anchor: AnchorConfig::default(),
            committer: CommitterConfig {
                idle_ttl_secs: 1,
                ..CommitterConfig::default()
            },
            chains,
            peers: Vec::new(),
            acl_deny,
            extra_local_domains: Vec::new(),
        }
    }

    pub struct Harness {
        pub source: Arc<ScriptedChain>,
        pub dest: Arc<ScriptedChain>,
        pub pool: Arc<MemoryMessagePool>,
        pub runner: Runner,
    }

    pub fn harness(acl_deny: Vec<(String, String)>) -> Harness {
        let src_config = chain_config("src", "src-1", "src.dom");
        let dst_config = chain_config("dst", "dst-1", "dst.dom");
        let config = config(vec![src_config.clone(), dst_config.clone()], acl_deny);

        let source = Arc::new(ScriptedChain::new(src_config.key()));
        let dest = Arc::new(ScriptedChain::new(dst_config.key()));
        let mut clients = ChainClientRegistry::new();
        clients.insert(src_config.key(), source.clone());
        clients.insert(dst_config.key(), dest.clone());

        let pool = Arc::new(MemoryMessagePool::new());
        let deps = RunnerDeps {
            pool: pool.clone(),
            heights: Arc::new(WatermarkCache::new(Arc::new(MemoryWatermarkStore::new()))),
            clients: Arc::new(clients),
            lock: Arc::new(LocalLock::new()),
            domains: Arc::new(StaticDomainRegistry::new(&config.chains, &[])),
            routing: Arc::new(HttpRoutingDirectory::new(&[], Duration::from_secs(1)).unwrap()),
            acl: Arc::new(DenyListAcl::new(&config.acl_deny)),
        };
        let runner = Runner::new(&config, deps).unwrap();

        Harness {
            source,
            dest,
            pool,
            runner,
        }
    }

    /// Poll `check` until it holds or `timeout` elapses
    pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }
}

use helpers::*;

#[tokio::test]
async fn test_messages_flow_from_source_to_destination_in_order() {
    let h = harness(Vec::new());
    h.source.emit(3, "dst.dom", 0);
    h.source.emit(4, "dst.dom", 1);
    h.source.emit(4, "dst.dom", 2);
    h.source.set_height(6);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = h.runner.spawn(shutdown_rx);

    let dest = h.dest.clone();
    let delivered = eventually(Duration::from_secs(10), || dest.committed_sequences().len() == 3).await;

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(delivered, "committed: {:?}", h.dest.committed_sequences());
    assert_eq!(h.dest.committed_sequences(), vec![0, 1, 2]);
    assert!(h.dest.committed().iter().all(|p| p.sender_domain == "src.dom"));

    let msgs = h.pool.sdp_msgs();
    assert_eq!(msgs.len(), 3);
    assert!(msgs.iter().all(|m| m.process_state == SdpMsgProcessState::TxSuccess));
    assert!(msgs.iter().all(|m| m.receiver_blockchain_id.as_deref() == Some("dst-1")));
}

#[tokio::test]
async fn test_acl_denied_messages_never_reach_destination() {
    let h = harness(vec![("src.dom".to_string(), "dst.dom".to_string())]);
    h.source.emit(2, "dst.dom", 0);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = h.runner.spawn(shutdown_rx);

    let pool = h.pool.clone();
    let rejected = eventually(Duration::from_secs(10), || {
        pool.sdp_msgs()
            .iter()
            .any(|m| m.process_state == SdpMsgProcessState::MsgRejected)
    })
    .await;

    // Give the commit loop a few passes to prove it leaves the message alone
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(rejected);
    assert!(h.dest.committed().is_empty());
    let msg = &h.pool.sdp_msgs()[0];
    assert_eq!(msg.fail_reason.as_deref(), Some("msg rejected by ACL"));
}

#[tokio::test]
async fn test_unknown_receiver_domain_is_rejected() {
    let h = harness(Vec::new());
    h.source.emit(1, "nowhere.dom", 0);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = h.runner.spawn(shutdown_rx);

    let pool = h.pool.clone();
    let rejected = eventually(Duration::from_secs(10), || {
        pool.sdp_msgs()
            .iter()
            .any(|m| m.process_state == SdpMsgProcessState::MsgRejected)
    })
    .await;

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(rejected);
    assert!(h.dest.committed().is_empty());
}

/// Requires a Postgres instance at DATABASE_URL
#[tokio::test]
#[ignore]
async fn test_postgres_message_pool_dedupes() {
    use am_relayer::db::{self, MessagePool, PgMessagePool};
    use am_relayer::models::AuthMsgWrapper;

    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            println!("Skipping: DATABASE_URL not set");
            return;
        }
    };
    let pg = db::create_pool(&url, 2).await.unwrap();
    db::run_migrations(&pg).await.unwrap();
    let pool = PgMessagePool::new(pg);

    let source = ScriptedChain::new(ChainKey::new("pg", "pg-1"));
    let height = chrono::Utc::now().timestamp_millis() as u64;
    source.emit(height, "dst.dom", 0);
    let block = source.block_at_height(height).await.unwrap();
    let am = AuthMsgWrapper::from_block_message(&block, "pg.dom", &block.messages[0]).unwrap();

    let id = pool.insert_auth_msg(&am).await.unwrap();
    assert!(id.is_some());
    assert_eq!(pool.insert_auth_msg(&am).await.unwrap(), None);

    let pending = pool.peek_pending_auth_msgs(&ChainKey::new("pg", "pg-1"), 100).await.unwrap();
    assert!(pending.iter().any(|p| Some(p.id) == id));
}
