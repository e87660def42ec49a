//! Fixtures and a scripted chain client shared by unit tests

use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::chain::{ChainClient, SubmitReceipt, TxResult, TxStatus};
use crate::codec::{AuthMessage, CommitPackage, SdpMessage, AM_VERSION, SDP_VERSION};
use crate::db::{MemoryMessagePool, MessagePool};
use crate::models::{
    new_correlation_id, AuthMsgWrapper, Block, CrossChainMessage, LedgerInfo, MsgSource,
    SdpMsgWrapper,
};
use crate::types::{
    AuthMsgProcessState, ChainKey, Identity, NotifyTaskType, SdpMsgProcessState, TrustLevel,
    UpperProtocol,
};

pub const SENDER: Identity = Identity([1u8; 32]);
pub const RECEIVER: Identity = Identity([2u8; 32]);

pub fn domain_of(chain: &ChainKey) -> String {
    format!("{}.dom", chain.blockchain_id)
}

pub fn sdp_body(receiver_domain: &str, receiver: Identity, sequence: i64) -> Vec<u8> {
    SdpMessage {
        version: SDP_VERSION,
        receiver_domain: receiver_domain.to_string(),
        receiver,
        sequence,
        message: b"payload".to_vec(),
    }
    .encode()
}

pub fn raw_am(sender: Identity, payload: Vec<u8>) -> Vec<u8> {
    AuthMessage {
        version: AM_VERSION,
        sender,
        protocol: UpperProtocol::Sdp,
        trust_level: TrustLevel::Zero,
        payload,
    }
    .encode()
}

/// Pending AM extracted from `chain` at `height`, carrying an SDP message
/// for `dest.dom`
pub fn auth_msg(chain: &ChainKey, height: u64, index: i32) -> AuthMsgWrapper {
    AuthMsgWrapper {
        id: 0,
        source: MsgSource {
            product: Some(chain.product.clone()),
            blockchain_id: Some(chain.blockchain_id.clone()),
            domain: domain_of(chain),
            am_client_contract: None,
        },
        correlation_id: new_correlation_id(),
        version: AM_VERSION,
        sender: SENDER,
        protocol: UpperProtocol::Sdp,
        trust_level: TrustLevel::Zero,
        payload: sdp_body("dest.dom", RECEIVER, 0),
        ledger: LedgerInfo {
            block_height: height,
            block_hash: format!("0xblock{}", height),
            block_timestamp: Utc::now(),
            tx_id: format!("0xtx{}", height),
            index_in_block: index,
            capture_time: Utc::now(),
        },
        is_local: true,
        process_state: AuthMsgProcessState::Pending,
    }
}

/// Pending SDP message from `src.dom` already resolved to `dest`
pub fn sdp_msg(auth_msg_id: i64, sequence: i64, dest: &ChainKey) -> SdpMsgWrapper {
    sdp_msg_from(auth_msg_id, sequence, dest, SENDER)
}

pub fn sdp_msg_from(auth_msg_id: i64, sequence: i64, dest: &ChainKey, sender: Identity) -> SdpMsgWrapper {
    SdpMsgWrapper {
        id: 0,
        auth_msg_id,
        version: SDP_VERSION,
        sequence,
        sender_domain: "src.dom".to_string(),
        sender,
        sender_product: Some("src".to_string()),
        sender_blockchain_id: Some("src-1".to_string()),
        receiver_domain: domain_of(dest),
        receiver: RECEIVER,
        receiver_product: Some(dest.product.clone()),
        receiver_blockchain_id: Some(dest.blockchain_id.clone()),
        receiver_contract: Some("0xreceiver".to_string()),
        payload: b"payload".to_vec(),
        process_state: SdpMsgProcessState::Pending,
        tx_hash: None,
        tx_success: None,
        fail_reason: None,
    }
}

/// Insert a proved AM plus its pending SDP message, returning the SDP id
pub async fn seed_sdp(pool: &MemoryMessagePool, dest: &ChainKey, sender: Identity, sequence: i64) -> i64 {
    let source = ChainKey::new("src", "src-1");
    let mut am = auth_msg(&source, pool.auth_msgs().len() as u64 + 1, 0);
    am.source.domain = "src.dom".to_string();
    am.sender = sender;
    am.payload = sdp_body(&domain_of(dest), RECEIVER, sequence);
    am.process_state = AuthMsgProcessState::Proved;
    let am_id = pool.insert_auth_msg(&am).await.unwrap().unwrap();
    pool.insert_sdp_msg(&sdp_msg_from(am_id, sequence, dest, sender))
        .await
        .unwrap()
}

/// A package the mock chain accepted
#[derive(Debug, Clone)]
pub struct Submission {
    pub session: String,
    pub sequence: i64,
    pub tx_id: String,
}

#[derive(Default)]
struct MockState {
    last_height: u64,
    fail_last_height: bool,
    blocks: HashMap<u64, Block>,
    failing_heights: HashSet<u64>,
    fetched: Vec<u64>,
    undeployed: bool,
    sequences: HashMap<String, i64>,
    submissions: Vec<Submission>,
    in_flight: HashMap<String, usize>,
    max_in_flight: usize,
    unconfirmed: bool,
    fail_submit: bool,
    rejected_sequences: HashSet<i64>,
    tx_results: HashMap<String, TxResult>,
}

/// Chain client whose heights, blocks and contract state are scripted
pub struct MockChainClient {
    pub chain: ChainKey,
    submit_delay: Duration,
    state: Mutex<MockState>,
}

fn session_of(sender_domain: &str, sender: &Identity, receiver_domain: &str, receiver: &Identity) -> String {
    format!(
        "{}.{}:{}.{}",
        sender_domain,
        sender.to_hex(),
        receiver_domain,
        receiver.to_hex()
    )
}

impl MockChainClient {
    pub fn new(chain: ChainKey) -> Self {
        Self {
            chain,
            submit_delay: Duration::ZERO,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_height(&self, height: u64) {
        self.state().last_height = height;
    }

    pub fn fail_height_query(&self, fail: bool) {
        self.state().fail_last_height = fail;
    }

    pub fn put_block(&self, block: Block) {
        self.state().blocks.insert(block.height, block);
    }

    /// Put a block at `height` holding one AM per entry of `payloads`
    pub fn put_messages(&self, height: u64, payloads: Vec<Vec<u8>>) {
        let mut block = Block::empty(self.chain.clone(), height);
        block.hash = format!("0xblock{}", height);
        block.messages = payloads
            .into_iter()
            .enumerate()
            .map(|(i, raw_am)| CrossChainMessage {
                tx_id: format!("0xtx{}-{}", height, i),
                index_in_block: i as i32,
                raw_am,
            })
            .collect();
        self.put_block(block);
    }

    pub fn fail_at(&self, height: u64) {
        self.state().failing_heights.insert(height);
    }

    pub fn heal(&self, height: u64) {
        self.state().failing_heights.remove(&height);
    }

    pub fn set_deployed(&self, deployed: bool) {
        self.state().undeployed = !deployed;
    }

    pub fn set_on_chain_sequence(&self, sender: Identity, receiver_domain: &str, next: i64) {
        let key = session_of("src.dom", &sender, receiver_domain, &RECEIVER);
        self.state().sequences.insert(key, next);
    }

    pub fn set_unconfirmed(&self, unconfirmed: bool) {
        self.state().unconfirmed = unconfirmed;
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.state().fail_submit = fail;
    }

    /// Submissions of `sequence` land on chain but revert
    pub fn reject_sequence(&self, sequence: i64) {
        self.state().rejected_sequences.insert(sequence);
    }

    pub fn set_tx_result(&self, tx_id: &str, status: TxStatus, error: Option<&str>) {
        self.state().tx_results.insert(
            tx_id.to_string(),
            TxResult {
                status,
                error_message: error.map(str::to_string),
            },
        );
    }

    pub fn fetched(&self) -> Vec<u64> {
        self.state().fetched.clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    /// Highest number of overlapping submissions seen for one session
    pub fn max_in_flight_per_session(&self) -> usize {
        self.state().max_in_flight
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn last_block_height(&self) -> Result<u64> {
        let state = self.state();
        if state.fail_last_height {
            return Err(eyre!("rpc unavailable"));
        }
        Ok(state.last_height)
    }

    async fn block_at_height(&self, height: u64) -> Result<Block> {
        let mut state = self.state();
        state.fetched.push(height);
        if state.failing_heights.contains(&height) {
            return Err(eyre!("failed to fetch block {}", height));
        }
        Ok(state
            .blocks
            .get(&height)
            .cloned()
            .unwrap_or_else(|| Block::empty(self.chain.clone(), height)))
    }

    async fn is_contract_deployed(&self, _task: NotifyTaskType) -> Result<bool> {
        Ok(!self.state().undeployed)
    }

    async fn submit_package(&self, package: &[u8]) -> Result<SubmitReceipt> {
        let pkg = CommitPackage::decode(package)?;
        let sdp = SdpMessage::decode(&pkg.am.payload)?;
        let session = session_of(&pkg.sender_domain, &pkg.am.sender, &sdp.receiver_domain, &sdp.receiver);

        {
            let mut state = self.state();
            if state.fail_submit {
                return Err(eyre!("submit rejected by node"));
            }
            let active = state.in_flight.entry(session.clone()).or_insert(0);
            *active += 1;
            let active = *active;
            if !sdp.is_unordered() {
                state.max_in_flight = state.max_in_flight.max(active);
            }
        }

        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }

        let mut state = self.state();
        if let Some(active) = state.in_flight.get_mut(&session) {
            *active -= 1;
        }
        let tx_id = format!("0xsubmit{}", state.submissions.len() + 1);
        state.submissions.push(Submission {
            session,
            sequence: sdp.sequence,
            tx_id: tx_id.clone(),
        });
        let rejected = state.rejected_sequences.contains(&sdp.sequence);
        if !sdp.is_unordered() && !rejected {
            let next = state.submissions.last().map(|s| s.sequence + 1).unwrap_or(0);
            let key = state.submissions.last().map(|s| s.session.clone()).unwrap_or_default();
            state.sequences.insert(key, next);
        }
        let confirmed = !state.unconfirmed;
        Ok(SubmitReceipt {
            tx_id,
            confirmed,
            success: !rejected,
            error_message: rejected.then(|| "execution reverted".to_string()),
        })
    }

    async fn query_on_chain_sequence(
        &self,
        sender_domain: &str,
        sender: &Identity,
        receiver_domain: &str,
        receiver: &Identity,
    ) -> Result<i64> {
        let key = session_of(sender_domain, sender, receiver_domain, receiver);
        Ok(self.state().sequences.get(&key).copied().unwrap_or(0))
    }

    async fn query_tx_result(&self, tx_id: &str) -> Result<TxResult> {
        Ok(self
            .state()
            .tx_results
            .get(tx_id)
            .cloned()
            .unwrap_or(TxResult {
                status: TxStatus::Pending,
                error_message: None,
            }))
    }
}
