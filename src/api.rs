//! HTTP server for health, metrics and pipeline status
//!
//! - GET /health  - stage loop health, 503 once a circuit breaker trips
//! - GET /metrics - Prometheus metrics
//! - GET /status  - per-chain watermarks and SDP message counts
//! - POST /v1/am   - AMs forwarded by peer relayers

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::WrapErr;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::anchor::WatermarkCache;
use crate::db::MessagePool;
use crate::metrics;
use crate::network::ForwardRequest;
use crate::processor::MessageProcessor;
use crate::runner::{HealthRegistry, StageHealth};
use crate::types::{ChainKey, NotifyTaskType, SdpMsgProcessState};

const REPORTED_STATES: [SdpMsgProcessState; 6] = [
    SdpMsgProcessState::Pending,
    SdpMsgProcessState::TxPending,
    SdpMsgProcessState::TxSuccess,
    SdpMsgProcessState::TxFailed,
    SdpMsgProcessState::MsgIllegal,
    SdpMsgProcessState::MsgRejected,
];

#[derive(Clone)]
pub struct AppState {
    pub chains: Arc<Vec<ChainKey>>,
    pub heights: Arc<WatermarkCache>,
    pub pool: Arc<dyn MessagePool>,
    pub health: Arc<HealthRegistry>,
    pub processor: Arc<MessageProcessor>,
    pub started: Instant,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub stages: BTreeMap<String, BTreeMap<&'static str, StageHealth>>,
}

#[derive(Debug, Serialize)]
pub struct ChainStatus {
    pub chain: String,
    pub polling: u64,
    pub sync: u64,
    pub notify: u64,
    /// SDP messages addressed to this chain, by state
    pub sdp_msgs: BTreeMap<&'static str, i64>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub chains: Vec<ChainStatus>,
}

async fn health_check(State(state): State<AppState>) -> Response {
    let healthy = state.health.all_healthy().await;
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        stages: state.health.snapshot().await,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let mut chains = Vec::with_capacity(state.chains.len());
    for chain in state.chains.iter() {
        chains.push(chain_status(&state, chain).await);
    }
    Json(StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        chains,
    })
}

async fn chain_status(state: &AppState, chain: &ChainKey) -> ChainStatus {
    let (polling, sync, notify) = match state.heights.heights(chain).await {
        Ok(h) => (h.polling(), h.sync(), h.notify(NotifyTaskType::CrossChainMessage)),
        Err(e) => {
            warn!(chain = %chain, error = %e, "Failed to read watermarks for status");
            (0, 0, 0)
        }
    };

    let mut sdp_msgs = BTreeMap::new();
    for s in REPORTED_STATES {
        let count = state.pool.count_sdp_msgs(chain, s).await.unwrap_or(0);
        sdp_msgs.insert(s.as_str(), count);
    }

    ChainStatus {
        chain: chain.to_string(),
        polling,
        sync,
        notify,
        sdp_msgs,
    }
}

#[derive(Debug, Serialize)]
pub struct ReceiveResponse {
    pub outcome: &'static str,
}

async fn receive_am(State(state): State<AppState>, Json(request): Json<ForwardRequest>) -> Response {
    if !state.processor.serves_domain(&request.receiver_domain) {
        warn!(
            sender_domain = %request.sender_domain,
            receiver_domain = %request.receiver_domain,
            "Forwarded AM for a domain not served here"
        );
        return (
            StatusCode::NOT_FOUND,
            format!("domain {} is not served by this relayer", request.receiver_domain),
        )
            .into_response();
    }

    let am = match request.to_auth_msg() {
        Ok(am) => am,
        Err(e) => {
            warn!(sender_domain = %request.sender_domain, error = %e, "Malformed forwarded AM");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    // A failed AM stays pooled as PENDING and is retried by the remote loop
    match state.processor.process_remote_am(am).await {
        Ok(outcome) => Json(ReceiveResponse {
            outcome: outcome.as_str(),
        })
        .into_response(),
        Err(e) => {
            error!(sender_domain = %request.sender_domain, error = ?e, "Failed to process forwarded AM");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to process forwarded AM").into_response()
        }
    }
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to build metrics response").into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/v1/am", post(receive_am))
        .with_state(state)
}

/// Serve the API until shutdown flips to `true`
pub async fn start_api_server(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind API server to {}", addr))?;
    info!(%addr, "API server started");
    metrics::UP.set(1.0);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    metrics::UP.set(0.0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ActivityTracker;
    use crate::codec::{AuthMessage, CommitPackage, AM_VERSION};
    use crate::config::ChainConfig;
    use crate::db::{MemoryMessagePool, MemoryWatermarkStore};
    use crate::models::WatermarkName;
    use crate::network::{DenyListAcl, ForwardedLedger, HttpRoutingDirectory, StaticDomainRegistry};
    use crate::test_utils::{domain_of, sdp_body, seed_sdp, RECEIVER, SENDER};
    use crate::types::{AuthMsgProcessState, TrustLevel, UpperProtocol};
    use base64::Engine as _;
    use std::time::Duration;

    async fn state() -> (AppState, Arc<MemoryMessagePool>) {
        let chain = ChainKey::new("dst", "dst-1");
        let heights = Arc::new(WatermarkCache::new(Arc::new(MemoryWatermarkStore::new())));
        heights.raise(&chain, WatermarkName::Polling, 12).await.unwrap();
        heights.raise(&chain, WatermarkName::Sync, 10).await.unwrap();
        let pool = Arc::new(MemoryMessagePool::new());
        let chains = vec![ChainConfig {
            product: chain.product.clone(),
            blockchain_id: chain.blockchain_id.clone(),
            domain: domain_of(&chain),
            plugin_url: "http://dst".to_string(),
            am_contract: "0xdstam".to_string(),
        }];
        let processor = Arc::new(MessageProcessor::new(
            pool.clone(),
            Arc::new(StaticDomainRegistry::new(&chains, &[])),
            Arc::new(HttpRoutingDirectory::new(&[], Duration::from_secs(1)).unwrap()),
            Arc::new(DenyListAcl::default()),
            Arc::new(ActivityTracker::new(4, Duration::from_secs(60))),
        ));
        let state = AppState {
            chains: Arc::new(vec![chain]),
            heights,
            pool: pool.clone(),
            health: Arc::new(HealthRegistry::new()),
            processor,
            started: Instant::now(),
        };
        (state, pool)
    }

    fn forward_request(receiver_domain: &str) -> ForwardRequest {
        let package = CommitPackage {
            sender_domain: "far.dom".to_string(),
            am: AuthMessage {
                version: AM_VERSION,
                sender: SENDER,
                protocol: UpperProtocol::Sdp,
                trust_level: TrustLevel::Zero,
                payload: sdp_body(receiver_domain, RECEIVER, 0),
            },
        };
        ForwardRequest::new(
            "far.dom",
            receiver_domain,
            &package.encode(),
            &[],
            ForwardedLedger {
                block_height: 5,
                block_hash: "0xfar5".to_string(),
                block_timestamp: 1_700_000_000,
                tx_id: "0xfartx".to_string(),
                index_in_block: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_forwarded_am_is_pooled_for_local_chain() {
        let (state, pool) = state().await;
        let dest = state.chains[0].clone();

        let response = receive_am(State(state.clone()), Json(forward_request("dst-1.dom"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let am = &pool.auth_msgs()[0];
        assert!(!am.is_local);
        assert_eq!(am.process_state, AuthMsgProcessState::Proved);
        let sdp = &pool.sdp_msgs()[0];
        assert_eq!(sdp.sender_domain, "far.dom");
        assert_eq!(sdp.receiver_chain(), Some(dest));

        // Redelivery is accepted without a second row
        let response = receive_am(State(state), Json(forward_request("dst-1.dom"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pool.sdp_msgs().len(), 1);
    }

    #[tokio::test]
    async fn test_forwarded_am_rejected_when_unusable() {
        let (state, pool) = state().await;

        let response = receive_am(State(state.clone()), Json(forward_request("elsewhere.dom"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let mut request = forward_request("dst-1.dom");
        request.encoded_am = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        let response = receive_am(State(state), Json(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(pool.auth_msgs().is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_watermarks_and_counts() {
        let (state, pool) = state().await;
        let dest = state.chains[0].clone();
        seed_sdp(&pool, &dest, SENDER, 0).await;
        seed_sdp(&pool, &dest, SENDER, 1).await;

        let Json(body) = status(State(state)).await;
        assert_eq!(body.chains.len(), 1);
        let chain = &body.chains[0];
        assert_eq!(chain.chain, "dst:dst-1");
        assert_eq!((chain.polling, chain.sync, chain.notify), (12, 10, 0));
        assert_eq!(chain.sdp_msgs["PENDING"], 2);
        assert_eq!(chain.sdp_msgs["TX_SUCCESS"], 0);
    }

    #[tokio::test]
    async fn test_health_ok_without_failures() {
        let (state, _pool) = state().await;
        let response = health_check(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_encodes() {
        metrics::UP.set(1.0);
        let response = prometheus_metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
