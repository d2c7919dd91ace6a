use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bqproxy_catalog::QuerySource;
use bqproxy_contracts::canonical;
use bqproxy_contracts::job::{self, JobCompletion};
use serde_json::Value;
use tracing::Instrument;

use super::gate::{check_daily_quota, check_query_size};
use super::{
    ApiError, AppState, ClientIp, ensure_project, extract_request_id, finish, json_error,
    passthrough_response, record_completion, warehouse_error_response,
};
use crate::metrics;

const USER_SQL_LABEL: &str = "user_sql";

/// `POST …/jobs`: rewrite against the catalog, dry run, gate on the estimate
/// and the client's daily usage, then submit for real.
pub(super) async fn submit_job(
    State(state): State<AppState>,
    Path(project): Path<String>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "job.submit",
        request_id = %request_id,
        client_ip = %client_ip,
        query_id = tracing::field::Empty,
        estimated_bytes = tracing::field::Empty,
        job_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        let result = gated_submit(&state, &project, &client_ip, &body).await;

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        match &result {
            Ok(resp) if resp.status().is_success() => {
                tracing::Span::current().record("outcome", "submitted");
            }
            Ok(_) => {
                tracing::Span::current().record("outcome", "upstream_error");
            }
            Err((status, _)) if status.is_client_error() => {
                tracing::Span::current().record("outcome", "rejected");
            }
            Err(_) => {
                tracing::Span::current().record("outcome", "error");
            }
        }
        tracing::info!("gateway.submit_job");
        result
    }
    .instrument(span)
    .await;

    finish(
        "/bqproxy/bigquery/v2/projects/{project}/jobs",
        "POST",
        started,
        result,
    )
}

async fn gated_submit(
    state: &AppState,
    project: &str,
    client_ip: &str,
    body: &[u8],
) -> Result<Response, ApiError> {
    ensure_project(state, project)?;

    let mut job = serde_json::from_slice::<Value>(body)
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid JSON body"))?;
    job::pin_project(&mut job, &state.config.project_id);

    let source = state
        .catalog
        .rewrite(&mut job, state.config.allow_user_sql)
        .map_err(|err| {
            metrics::observe_gate_rejection(err.reason());
            json_error(StatusCode::BAD_REQUEST, err.to_string())
        })?;
    let query_label = source.query_id().unwrap_or(USER_SQL_LABEL).to_string();
    tracing::Span::current().record("query_id", query_label.as_str());
    if source == QuerySource::UserSql
        && let Some(sql) = job.pointer("/configuration/query/query").and_then(Value::as_str)
    {
        tracing::info!(sql_sha256 = %canonical::sql_fingerprint(sql), "accepted user sql");
    }

    let dry_run = state
        .warehouse
        .insert_job(&state.config.project_id, &job::prepare_dry_run(&job))
        .await
        .map_err(|err| warehouse_error_response(&err))?;
    if !dry_run.status.is_success() {
        tracing::info!(status = dry_run.status.as_u16(), "dry run refused upstream");
        return Ok(passthrough_response(dry_run));
    }

    let estimated_bytes = dry_run
        .json()
        .as_ref()
        .and_then(job::dry_run_estimate)
        .ok_or_else(|| {
            json_error(
                StatusCode::BAD_GATEWAY,
                "dry run response did not include an estimate",
            )
        })?;
    tracing::Span::current().record("estimated_bytes", estimated_bytes);
    metrics::observe_dry_run_estimate(&query_label, estimated_bytes);

    let limits = state.gate_limits();
    check_query_size(&limits, estimated_bytes).map_err(|rejection| {
        metrics::observe_gate_rejection(rejection.reason());
        json_error(StatusCode::BAD_REQUEST, rejection.message())
    })?;

    if let Some(quota) = state.active_quota() {
        let usage = quota.usage(client_ip).await.map_err(|err| {
            tracing::error!(error = %err, "failed to read daily usage");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "quota store unavailable")
        })?;
        check_daily_quota(&limits, estimated_bytes, &usage).map_err(|rejection| {
            metrics::observe_gate_rejection(rejection.reason());
            tracing::info!(
                used_gb = usage.used_gb,
                reason = rejection.reason(),
                "submission refused by daily quota"
            );
            json_error(StatusCode::BAD_REQUEST, rejection.message())
        })?;
    }

    let submitted = state
        .warehouse
        .insert_job(&state.config.project_id, &job::prepare_execution(&job))
        .await
        .map_err(|err| warehouse_error_response(&err))?;

    if submitted.status.is_success()
        && let Some(resource) = submitted.json()
        && let Some(job_id) = job::job_id(&resource)
    {
        tracing::Span::current().record("job_id", job_id);
        // cached or very short queries can finish inside the insert call
        if let Some(completion) = JobCompletion::from_job_resource(&resource, job_id) {
            record_completion(state, client_ip, &completion).await;
        }
    }

    Ok(passthrough_response(submitted))
}
