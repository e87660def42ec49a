//! Local driver
//!
//! Every managed chain gets three loops:
//! - anchor: polling, sync and notify, one after the other
//! - process: pending AMs extracted from the chain
//! - commit: SDP messages addressed to the chain, then TX confirmation
//!
//! Each loop counts consecutive failures, backs off exponentially and
//! pauses once the circuit breaker threshold is reached. The loops stop
//! when the shutdown channel flips to `true`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::anchor::{
    BlockNotifyTask, BlockPollingTask, BlockQueue, BlockSyncTask, CrossChainMessageWorker, WatermarkCache,
};
use crate::cache::ActivityTracker;
use crate::chain::ChainClientRegistry;
use crate::committer::{CommitterService, TxConfirmationTask};
use crate::config::{ChainConfig, Config};
use crate::db::MessagePool;
use crate::lock::ClusterLock;
use crate::metrics;
use crate::network::{AclService, DomainRegistry, RoutingDirectory};
use crate::processor::MessageProcessor;
use crate::types::{ChainKey, NotifyTaskType};

/// Circuit breaker configuration for stage loops
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before pausing
    pub threshold: u32,
    /// How long to pause when the circuit breaker trips
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            pause_duration: Duration::from_secs(300),
        }
    }
}

/// Backoff between failed stage runs
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// One unit of periodic work for a chain
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> Result<()>;
}

/// Health of one stage loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Stage health shared with the API, keyed by chain then stage
#[derive(Debug, Default)]
pub struct HealthRegistry {
    stages: RwLock<BTreeMap<String, BTreeMap<&'static str, StageHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update(&self, chain: &ChainKey, stage: &'static str, f: impl FnOnce(&mut StageHealth)) {
        let mut stages = self.stages.write().await;
        let health = stages.entry(chain.to_string()).or_default().entry(stage).or_default();
        f(health);
    }

    pub async fn snapshot(&self) -> BTreeMap<String, BTreeMap<&'static str, StageHealth>> {
        self.stages.read().await.clone()
    }

    /// True when no stage has reached its circuit breaker threshold
    pub async fn all_healthy(&self) -> bool {
        self.stages
            .read()
            .await
            .values()
            .flat_map(|stages| stages.values())
            .all(|h| h.healthy)
    }
}

/// Runs one stage periodically with backoff and a circuit breaker
pub struct StageLoop {
    chain: ChainKey,
    stage: Box<dyn Stage>,
    interval: Duration,
    retry_config: RetryConfig,
    circuit_breaker: CircuitBreakerConfig,
    consecutive_failures: u32,
    health: Arc<HealthRegistry>,
}

impl StageLoop {
    pub fn new(chain: ChainKey, stage: Box<dyn Stage>, interval: Duration, health: Arc<HealthRegistry>) -> Self {
        Self {
            chain,
            stage,
            interval,
            retry_config: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            consecutive_failures: 0,
            health,
        }
    }

    pub fn with_retry(mut self, retry_config: RetryConfig, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.retry_config = retry_config;
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            chain = %self.chain,
            stage = self.stage.name(),
            interval_ms = self.interval.as_millis() as u64,
            "Stage loop starting"
        );
        self.health
            .update(&self.chain, self.stage.name(), |h| h.healthy = true)
            .await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = tokio::select! {
                delay = self.tick() => delay,
                _ = shutdown.changed() => break,
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!(chain = %self.chain, stage = self.stage.name(), "Stage loop stopped");
    }

    /// Run the stage once; returns how long to wait before the next run
    async fn tick(&mut self) -> Duration {
        let name = self.stage.name();

        if self.consecutive_failures >= self.circuit_breaker.threshold {
            warn!(
                chain = %self.chain,
                stage = name,
                failures = self.consecutive_failures,
                pause_secs = self.circuit_breaker.pause_duration.as_secs(),
                "Circuit breaker tripped, pausing stage"
            );
            self.consecutive_failures = 0;
            return self.circuit_breaker.pause_duration;
        }

        match self.stage.run_once().await {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    info!(
                        chain = %self.chain,
                        stage = name,
                        after_failures = self.consecutive_failures,
                        "Stage recovered"
                    );
                }
                self.consecutive_failures = 0;
                metrics::set_consecutive_failures(&self.chain, name, 0);
                self.health
                    .update(&self.chain, name, |h| {
                        h.healthy = true;
                        h.consecutive_failures = 0;
                        h.last_success = Some(Utc::now());
                        h.last_error = None;
                    })
                    .await;
                self.interval
            }
            Err(e) => {
                self.consecutive_failures += 1;
                let failures = self.consecutive_failures;
                let threshold = self.circuit_breaker.threshold;
                let backoff = self.retry_config.backoff_for_attempt(failures);
                metrics::record_error(&self.chain.to_string(), name);
                metrics::set_consecutive_failures(&self.chain, name, failures);
                error!(
                    chain = %self.chain,
                    stage = name,
                    error = ?e,
                    consecutive_failures = failures,
                    next_backoff_secs = backoff.as_secs(),
                    "Stage failed, will retry with backoff"
                );
                let message = e.to_string();
                self.health
                    .update(&self.chain, name, |h| {
                        h.healthy = failures < threshold;
                        h.consecutive_failures = failures;
                        h.last_error = Some(message);
                    })
                    .await;
                backoff
            }
        }
    }
}

/// Polling, sync and notify for one chain
pub struct AnchorStage {
    polling: BlockPollingTask,
    sync: BlockSyncTask,
    notify: BlockNotifyTask,
}

impl AnchorStage {
    pub fn new(polling: BlockPollingTask, sync: BlockSyncTask, notify: BlockNotifyTask) -> Self {
        Self { polling, sync, notify }
    }
}

#[async_trait]
impl Stage for AnchorStage {
    fn name(&self) -> &'static str {
        "anchor"
    }

    async fn run_once(&self) -> Result<()> {
        // Each stage works from its own watermarks; a failing fetch at the
        // chain tip must not stop notify from draining queued blocks
        let polled = self.polling.process().await;
        let synced = self.sync.process().await;
        let notified = self.notify.process().await;
        polled.and(synced).and(notified)
    }
}

/// Pending AMs extracted from one chain
pub struct ProcessStage {
    chain: ChainKey,
    processor: Arc<MessageProcessor>,
    batch_size: i64,
}

#[async_trait]
impl Stage for ProcessStage {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run_once(&self) -> Result<()> {
        let processed = self.processor.process_pending(&self.chain, self.batch_size).await?;
        if processed > 0 {
            debug!(chain = %self.chain, processed, "Processed authenticated messages");
        }
        Ok(())
    }
}

/// Remote AMs whose delivery failed after they were pooled
pub struct RemoteProcessStage {
    processor: Arc<MessageProcessor>,
    batch_size: i64,
}

#[async_trait]
impl Stage for RemoteProcessStage {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn run_once(&self) -> Result<()> {
        let processed = self.processor.process_pending_remote(self.batch_size).await?;
        if processed > 0 {
            debug!(processed, "Retried remote authenticated messages");
        }
        Ok(())
    }
}

/// Commits and TX confirmation for one destination chain
pub struct CommitStage {
    chain: ChainKey,
    committer: Arc<CommitterService>,
    confirmation: Arc<TxConfirmationTask>,
}

#[async_trait]
impl Stage for CommitStage {
    fn name(&self) -> &'static str {
        "commit"
    }

    async fn run_once(&self) -> Result<()> {
        let settled = self.confirmation.process(&self.chain).await?;
        if settled > 0 {
            debug!(chain = %self.chain, settled, "Settled in-flight transactions");
        }
        self.committer.process(&self.chain).await?;
        Ok(())
    }
}

/// Shared services the runner wires into every chain
pub struct RunnerDeps {
    pub pool: Arc<dyn MessagePool>,
    pub heights: Arc<WatermarkCache>,
    pub clients: Arc<ChainClientRegistry>,
    pub lock: Arc<dyn ClusterLock>,
    pub domains: Arc<dyn DomainRegistry>,
    pub routing: Arc<dyn RoutingDirectory>,
    pub acl: Arc<dyn AclService>,
}

/// Health key of loops that are not tied to one managed chain
pub fn inbound_key() -> ChainKey {
    ChainKey::new("peers", "inbound")
}

/// Builds and spawns the stage loops of every managed chain
pub struct Runner {
    loops: Vec<StageLoop>,
    health: Arc<HealthRegistry>,
    processor: Arc<MessageProcessor>,
}

impl Runner {
    pub fn new(config: &Config, deps: RunnerDeps) -> Result<Self> {
        let health = Arc::new(HealthRegistry::new());
        let activity = Arc::new(ActivityTracker::new(
            config.chains.len().max(1),
            config.committer.idle_ttl(),
        ));
        let fetch_pool = Arc::new(Semaphore::new(config.anchor.sync_async_query_size as usize));

        let processor = Arc::new(MessageProcessor::new(
            deps.pool.clone(),
            deps.domains.clone(),
            deps.routing.clone(),
            deps.acl.clone(),
            activity.clone(),
        ));
        let committer = Arc::new(CommitterService::new(
            deps.pool.clone(),
            deps.clients.clone(),
            deps.lock.clone(),
            activity,
            config.committer.clone(),
        ));
        let confirmation = Arc::new(TxConfirmationTask::new(
            deps.pool.clone(),
            deps.clients.clone(),
            config.committer.commit_batch_size,
        ));

        let mut loops = Vec::with_capacity(config.chains.len() * 3 + 1);
        loops.push(StageLoop::new(
            inbound_key(),
            Box::new(RemoteProcessStage {
                processor: processor.clone(),
                batch_size: config.committer.commit_batch_size,
            }),
            config.poll_interval(),
            health.clone(),
        ));
        for chain_config in &config.chains {
            let chain = chain_config.key();
            let anchor = build_anchor_stage(config, chain_config, &deps, fetch_pool.clone())?;
            loops.push(StageLoop::new(
                chain.clone(),
                Box::new(anchor),
                config.poll_interval(),
                health.clone(),
            ));
            loops.push(StageLoop::new(
                chain.clone(),
                Box::new(ProcessStage {
                    chain: chain.clone(),
                    processor: processor.clone(),
                    batch_size: config.committer.commit_batch_size,
                }),
                config.poll_interval(),
                health.clone(),
            ));
            loops.push(StageLoop::new(
                chain.clone(),
                Box::new(CommitStage {
                    chain,
                    committer: committer.clone(),
                    confirmation: confirmation.clone(),
                }),
                config.poll_interval(),
                health.clone(),
            ));
        }

        Ok(Self {
            loops,
            health,
            processor,
        })
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        self.health.clone()
    }

    /// Processor shared with the API for AMs forwarded by peers
    pub fn processor(&self) -> Arc<MessageProcessor> {
        self.processor.clone()
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(loops = self.loops.len(), "Starting stage loops");
        self.loops
            .into_iter()
            .map(|stage_loop| tokio::spawn(stage_loop.run(shutdown.clone())))
            .collect()
    }
}

fn build_anchor_stage(
    config: &Config,
    chain_config: &ChainConfig,
    deps: &RunnerDeps,
    fetch_pool: Arc<Semaphore>,
) -> Result<AnchorStage> {
    let chain = chain_config.key();
    let client = deps.clients.get(&chain)?;
    let queue = Arc::new(BlockQueue::new(chain.clone(), config.anchor.block_queue_capacity));

    let polling = BlockPollingTask::new(chain.clone(), client.clone(), deps.heights.clone());
    let sync = BlockSyncTask::new(
        chain.clone(),
        client.clone(),
        deps.heights.clone(),
        queue.clone(),
        fetch_pool,
        config.anchor.clone(),
    );
    let mut notify = BlockNotifyTask::new(
        chain,
        client,
        deps.heights.clone(),
        queue,
        config.anchor.notify_batch_size,
    );
    let am_contract = Some(chain_config.am_contract.clone()).filter(|c| !c.is_empty());
    notify.register(
        NotifyTaskType::CrossChainMessage,
        Arc::new(CrossChainMessageWorker::new(
            chain_config.domain.clone(),
            am_contract,
            deps.pool.clone(),
        )),
    );
    Ok(AnchorStage::new(polling, sync, notify))
}
