use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bqproxy_auth::{AccessTokenProvider, CredentialSource, ServiceAccountKey, TokenProviderConfig};
use bqproxy_catalog::QueryCatalog;
use bqproxy_contracts::{ErrorEnvelope, gb_to_bytes};
use bqproxy_contracts::job::JobCompletion;
use bqproxy_quota::{KvStore, MemoryKv, QuotaLedger, QuotaPolicy, RedisKv};
use serde::Serialize;
use ulid::Ulid;

use crate::config::{CredentialsConfig, GatewayConfig, QuotaBackend, StartupError};
use crate::warehouse::{UpstreamResponse, WarehouseClient, WarehouseClientConfig, WarehouseError};

mod gate;
mod passthrough;
mod submit;

pub use self::gate::{GateLimits, GateRejection};

const PROJECT_ROOT: &str = "/bqproxy/bigquery/v2/projects/{project}";
const MAX_RESOURCE_ID_LEN: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    catalog: Arc<QueryCatalog>,
    warehouse: WarehouseClient,
    quota: Option<QuotaLedger>,
}

impl AppState {
    /// Assembles state from already-built parts. `quota` is only consulted
    /// when `config.daily_quota_gb` is set.
    pub fn new(
        config: GatewayConfig,
        catalog: QueryCatalog,
        warehouse: WarehouseClient,
        quota: Option<QuotaLedger>,
    ) -> Self {
        Self {
            config,
            catalog: Arc::new(catalog),
            warehouse,
            quota,
        }
    }

    fn gate_limits(&self) -> GateLimits {
        GateLimits {
            max_query_bytes: self.config.max_query_bytes,
            daily_quota_gb: self.config.daily_quota_gb,
        }
    }

    fn active_quota(&self) -> Option<&QuotaLedger> {
        self.config.daily_quota_gb.and(self.quota.as_ref())
    }
}

type ApiError = (StatusCode, Json<ErrorEnvelope>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let catalog = QueryCatalog::load(config.query_catalog_path.as_deref()).map_err(|err| {
        StartupError {
            code: "ERR_INVALID_CATALOG",
            message: err.to_string(),
        }
    })?;

    let source = match &config.credentials {
        CredentialsConfig::StaticToken(token) => CredentialSource::Static(token.clone()),
        CredentialsConfig::ServiceAccountFile(path) => CredentialSource::ServiceAccount(
            ServiceAccountKey::from_file(path).map_err(|err| StartupError {
                code: err.code,
                message: err.message,
            })?,
        ),
        CredentialsConfig::MetadataServer { token_url } => CredentialSource::MetadataServer {
            token_url: token_url.clone(),
        },
    };
    let tokens =
        AccessTokenProvider::new(TokenProviderConfig::new(source)).map_err(|err| StartupError {
            code: err.code,
            message: err.message,
        })?;

    let warehouse = WarehouseClient::new(
        WarehouseClientConfig {
            base_url: config.warehouse_base_url.clone(),
            timeout: Duration::from_millis(config.warehouse_timeout_ms),
        },
        tokens,
    )
    .map_err(|_| StartupError {
        code: "ERR_INTERNAL",
        message: "failed to initialize warehouse client".to_string(),
    })?;

    let quota = if config.daily_quota_gb.is_some() {
        Some(build_quota_ledger(&config)?)
    } else {
        None
    };

    let catalog_ids = catalog.ids().collect::<Vec<_>>().join(",");
    tracing::info!(
        project_id = %config.project_id,
        catalog_entries = catalog.len(),
        catalog_ids = %catalog_ids,
        catalog_fingerprint = %catalog.fingerprint(),
        credentials = warehouse.tokens().source_kind(),
        daily_quota_bytes = config.daily_quota_gb.map(gb_to_bytes).unwrap_or(0),
        quota_mode = ?config.quota_mode,
        "gateway configured"
    );

    Ok(router_with_state(AppState::new(
        config, catalog, warehouse, quota,
    )))
}

fn build_quota_ledger(config: &GatewayConfig) -> Result<QuotaLedger, StartupError> {
    let store: Arc<dyn KvStore> = match config.quota_backend {
        QuotaBackend::Memory => {
            tracing::warn!("in-memory quota store; usage is not shared between instances");
            Arc::new(MemoryKv::new())
        }
        QuotaBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "missing required config key BQPROXY_REDIS_URL".to_string(),
            })?;
            Arc::new(
                RedisKv::new(url, Duration::from_millis(config.quota_store_timeout_ms))
                    .map_err(|err| StartupError {
                        code: "ERR_INVALID_CONFIG",
                        message: format!("invalid BQPROXY_REDIS_URL: {}", err),
                    })?,
            )
        }
    };

    let policy = QuotaPolicy {
        marker_ttl: Duration::from_secs(config.quota_marker_ttl_secs),
        lock_ttl: Duration::from_millis(config.quota_lock_ttl_ms),
        key_prefix: config.quota_key_prefix.clone(),
        mode: config.quota_mode,
        ..QuotaPolicy::default()
    };

    Ok(QuotaLedger::new(store, policy))
}

pub fn router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(
            &format!("{}/jobs", PROJECT_ROOT),
            post(submit::submit_job),
        )
        .route(
            &format!("{}/jobs/{{job_id}}", PROJECT_ROOT),
            get(passthrough::get_job),
        )
        .route(
            &format!("{}/queries/{{job_id}}", PROJECT_ROOT),
            get(passthrough::get_query_results),
        )
        .route(
            &format!("{}/datasets", PROJECT_ROOT),
            get(passthrough::list_datasets),
        )
        .route(
            &format!("{}/datasets/{{dataset_id}}/tables", PROJECT_ROOT),
            get(passthrough::list_tables),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let credentials_ready = state.warehouse.tokens().access_token().await.is_ok();
    checks.insert("credentials", credentials_ready);

    if let Some(quota) = state.active_quota() {
        checks.insert("quota_store", quota.ping().await.is_ok());
    }

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// The address quota is charged to. Behind trusted load balancers each proxy
/// appends the address it saw to `X-Forwarded-For`, so the client is the hop
/// `trusted_proxy_hops` from the right; anything further left is client
/// supplied. Falls back to the socket peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let trusted_hops = if state.config.trust_forwarded_for {
            state.config.trusted_proxy_hops
        } else {
            0
        };
        Ok(ClientIp(resolve_client_ip(&parts.headers, peer, trusted_hops)))
    }
}

fn resolve_client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trusted_hops: usize) -> String {
    if trusted_hops > 0 {
        let hops = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .collect::<Vec<_>>();

        if let Some(index) = hops.len().checked_sub(trusted_hops)
            && let Ok(ip) = hops[index].parse::<IpAddr>()
        {
            return ip.to_string();
        }
    }

    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

/// Job and dataset ids are interpolated into upstream paths.
fn is_valid_resource_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_RESOURCE_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn ensure_project(state: &AppState, project: &str) -> Result<(), ApiError> {
    if project == state.config.project_id {
        Ok(())
    } else {
        Err(json_error(StatusCode::NOT_FOUND, "project not found"))
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorEnvelope::new(status.as_u16(), message)),
    )
}

fn warehouse_error_response(err: &WarehouseError) -> ApiError {
    match err {
        WarehouseError::Timeout => {
            json_error(StatusCode::GATEWAY_TIMEOUT, "warehouse request timed out")
        }
        WarehouseError::Http(_) => json_error(StatusCode::BAD_GATEWAY, "warehouse unavailable"),
        WarehouseError::Credentials(_) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "warehouse credentials unavailable",
        ),
    }
}

/// Relays an upstream response: same status, content type and body.
fn passthrough_response(resp: UpstreamResponse) -> Response {
    let mut headers = HeaderMap::new();
    let content_type = resp
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    headers.insert(header::CONTENT_TYPE, content_type);
    (resp.status, headers, resp.body).into_response()
}

/// Charges a finished job to the client. A completion without a byte count
/// is looked up with a server-side `jobs.get`. Failures are logged; the client
/// response is not affected.
async fn record_completion(state: &AppState, client_ip: &str, completion: &JobCompletion) {
    let Some(quota) = state.active_quota() else {
        return;
    };

    let bytes_processed = match completion.bytes_processed {
        Some(bytes) => bytes,
        None => match lookup_bytes_processed(state, &completion.job_id).await {
            Some(bytes) => bytes,
            None => {
                crate::metrics::observe_quota_completion("error");
                tracing::warn!(
                    client_ip = %client_ip,
                    job_id = %completion.job_id,
                    "finished job has no byte count; not charged yet"
                );
                return;
            }
        },
    };

    match quota
        .record_completion(client_ip, &completion.job_id, bytes_processed)
        .await
    {
        Ok(outcome) => {
            crate::metrics::observe_quota_completion(outcome.as_str());
            tracing::info!(
                client_ip = %client_ip,
                job_id = %completion.job_id,
                bytes_processed,
                outcome = outcome.as_str(),
                "quota.record_completion"
            );
        }
        Err(err) => {
            crate::metrics::observe_quota_completion("error");
            tracing::error!(
                client_ip = %client_ip,
                job_id = %completion.job_id,
                bytes_processed,
                error = %err,
                "failed to record job completion"
            );
        }
    }
}

/// Byte count from the full job resource. A `DONE` job that still reports no
/// count processed nothing.
async fn lookup_bytes_processed(state: &AppState, job_id: &str) -> Option<u64> {
    let resp = match state
        .warehouse
        .get_job(&state.config.project_id, job_id, None)
        .await
    {
        Ok(resp) if resp.status.is_success() => resp,
        Ok(resp) => {
            tracing::warn!(job_id = %job_id, status = resp.status.as_u16(), "job lookup refused upstream");
            return None;
        }
        Err(_) => return None,
    };

    resp.json()
        .as_ref()
        .and_then(|job| JobCompletion::from_job_resource(job, job_id))
        .map(|completion| completion.bytes_processed.unwrap_or(0))
}

fn finish(
    route: &'static str,
    method: &'static str,
    started: Instant,
    result: Result<Response, ApiError>,
) -> Response {
    let response = match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    crate::metrics::observe_http_request(
        route,
        method,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}
