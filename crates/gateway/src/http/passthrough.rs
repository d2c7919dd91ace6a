use std::time::Instant;

use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bqproxy_contracts::job::JobCompletion;
use serde_json::Value;
use tracing::Instrument;

use super::{
    ApiError, AppState, ClientIp, ensure_project, extract_request_id, finish, is_valid_resource_id,
    json_error, passthrough_response, record_completion, warehouse_error_response,
};
use crate::warehouse::UpstreamResponse;

/// Which payload shape a polled job reports completion in.
#[derive(Clone, Copy)]
enum Poll {
    Job,
    QueryResults,
}

impl Poll {
    fn completion(self, payload: &Value, job_id: &str) -> Option<JobCompletion> {
        match self {
            Poll::Job => JobCompletion::from_job_resource(payload, job_id),
            Poll::QueryResults => JobCompletion::from_query_results(payload, job_id),
        }
    }
}

pub(super) async fn get_job(
    State(state): State<AppState>,
    Path((project, job_id)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let span = tracing::info_span!(
        "job.get",
        request_id = %extract_request_id(&headers),
        client_ip = %client_ip,
        job_id = %job_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        ensure_project(&state, &project)?;
        ensure_resource_id(&job_id, "job id")?;

        let resp = state
            .warehouse
            .get_job(&state.config.project_id, &job_id, raw_query.as_deref())
            .await
            .map_err(|err| warehouse_error_response(&err))?;
        Ok::<_, ApiError>(relay_polled(&state, &client_ip, &job_id, Poll::Job, resp, started).await)
    }
    .instrument(span)
    .await;

    finish(
        "/bqproxy/bigquery/v2/projects/{project}/jobs/{job_id}",
        "GET",
        started,
        result,
    )
}

pub(super) async fn get_query_results(
    State(state): State<AppState>,
    Path((project, job_id)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let span = tracing::info_span!(
        "job.results",
        request_id = %extract_request_id(&headers),
        client_ip = %client_ip,
        job_id = %job_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        ensure_project(&state, &project)?;
        ensure_resource_id(&job_id, "job id")?;

        let resp = state
            .warehouse
            .get_query_results(&state.config.project_id, &job_id, raw_query.as_deref())
            .await
            .map_err(|err| warehouse_error_response(&err))?;
        Ok::<_, ApiError>(relay_polled(&state, &client_ip, &job_id, Poll::QueryResults, resp, started).await)
    }
    .instrument(span)
    .await;

    finish(
        "/bqproxy/bigquery/v2/projects/{project}/queries/{job_id}",
        "GET",
        started,
        result,
    )
}

pub(super) async fn list_datasets(
    State(state): State<AppState>,
    Path(project): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let span = tracing::info_span!(
        "datasets.list",
        request_id = %extract_request_id(&headers),
        project_id = %project,
        outcome = tracing::field::Empty,
    );

    let result = async {
        ensure_listing(&state, &project)?;
        let resp = state
            .warehouse
            .list_datasets(&project, raw_query.as_deref())
            .await
            .map_err(|err| warehouse_error_response(&err))?;
        tracing::Span::current().record("outcome", resp.status.as_str());
        Ok::<_, ApiError>(passthrough_response(resp))
    }
    .instrument(span)
    .await;

    finish(
        "/bqproxy/bigquery/v2/projects/{project}/datasets",
        "GET",
        started,
        result,
    )
}

pub(super) async fn list_tables(
    State(state): State<AppState>,
    Path((project, dataset_id)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let span = tracing::info_span!(
        "tables.list",
        request_id = %extract_request_id(&headers),
        project_id = %project,
        dataset_id = %dataset_id,
        outcome = tracing::field::Empty,
    );

    let result = async {
        ensure_listing(&state, &project)?;
        ensure_resource_id(&dataset_id, "dataset id")?;
        let resp = state
            .warehouse
            .list_tables(&project, &dataset_id, raw_query.as_deref())
            .await
            .map_err(|err| warehouse_error_response(&err))?;
        tracing::Span::current().record("outcome", resp.status.as_str());
        Ok::<_, ApiError>(passthrough_response(resp))
    }
    .instrument(span)
    .await;

    finish(
        "/bqproxy/bigquery/v2/projects/{project}/datasets/{dataset_id}/tables",
        "GET",
        started,
        result,
    )
}

async fn relay_polled(
    state: &AppState,
    client_ip: &str,
    job_id: &str,
    poll: Poll,
    resp: UpstreamResponse,
    started: Instant,
) -> Response {
    tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);

    if !resp.status.is_success() {
        tracing::Span::current().record("outcome", "upstream_error");
        return passthrough_response(resp);
    }

    match resp.json().as_ref().and_then(|payload| poll.completion(payload, job_id)) {
        Some(completion) => {
            tracing::Span::current().record("outcome", "done");
            record_completion(state, client_ip, &completion).await;
        }
        None => {
            tracing::Span::current().record("outcome", "pending");
        }
    }

    passthrough_response(resp)
}

fn ensure_resource_id(id: &str, what: &str) -> Result<(), ApiError> {
    if is_valid_resource_id(id) {
        Ok(())
    } else {
        Err(json_error(StatusCode::BAD_REQUEST, format!("invalid {}", what)))
    }
}

fn ensure_listing(state: &AppState, project: &str) -> Result<(), ApiError> {
    if !state.config.enable_listing
        || !state
            .config
            .listing_projects
            .iter()
            .any(|allowed| allowed == project)
    {
        return Err(json_error(StatusCode::NOT_FOUND, "project not found"));
    }
    Ok(())
}
