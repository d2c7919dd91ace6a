use std::time::Duration;

use bqproxy_auth::{AccessTokenProvider, AuthError};
use reqwest::StatusCode;
use serde_json::Value;

use crate::metrics;

#[derive(Debug)]
pub enum WarehouseError {
    Timeout,
    Http(reqwest::Error),
    Credentials(AuthError),
}

impl WarehouseError {
    fn metric_label(&self) -> &'static str {
        match self {
            WarehouseError::Timeout => "timeout",
            WarehouseError::Http(_) => "transport",
            WarehouseError::Credentials(_) => "credentials",
        }
    }
}

impl std::fmt::Display for WarehouseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WarehouseError::Timeout => write!(f, "warehouse request timed out"),
            WarehouseError::Http(err) => write!(f, "warehouse HTTP error: {}", err),
            WarehouseError::Credentials(err) => write!(f, "warehouse credentials error: {}", err),
        }
    }
}

impl std::error::Error for WarehouseError {}

impl From<reqwest::Error> for WarehouseError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            WarehouseError::Timeout
        } else {
            WarehouseError::Http(value)
        }
    }
}

impl From<AuthError> for WarehouseError {
    fn from(value: AuthError) -> Self {
        WarehouseError::Credentials(value)
    }
}

/// A warehouse response kept as raw bytes so it can be relayed unchanged.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Debug, Clone)]
pub struct WarehouseClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct WarehouseClient {
    base_url: String,
    http: reqwest::Client,
    tokens: AccessTokenProvider,
}

impl WarehouseClient {
    pub fn new(
        config: WarehouseClientConfig,
        tokens: AccessTokenProvider,
    ) -> Result<Self, WarehouseError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(WarehouseError::Http)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            tokens,
        })
    }

    pub fn tokens(&self) -> &AccessTokenProvider {
        &self.tokens
    }

    pub async fn insert_job(
        &self,
        project_id: &str,
        job: &Value,
    ) -> Result<UpstreamResponse, WarehouseError> {
        let url = self.project_url(project_id, "jobs", None);
        self.send("insert_job", self.http.post(url).json(job)).await
    }

    pub async fn get_job(
        &self,
        project_id: &str,
        job_id: &str,
        raw_query: Option<&str>,
    ) -> Result<UpstreamResponse, WarehouseError> {
        let url = self.project_url(project_id, &format!("jobs/{}", job_id), raw_query);
        self.send("get_job", self.http.get(url)).await
    }

    pub async fn get_query_results(
        &self,
        project_id: &str,
        job_id: &str,
        raw_query: Option<&str>,
    ) -> Result<UpstreamResponse, WarehouseError> {
        let url = self.project_url(project_id, &format!("queries/{}", job_id), raw_query);
        self.send("get_query_results", self.http.get(url)).await
    }

    pub async fn list_datasets(
        &self,
        project_id: &str,
        raw_query: Option<&str>,
    ) -> Result<UpstreamResponse, WarehouseError> {
        let url = self.project_url(project_id, "datasets", raw_query);
        self.send("list_datasets", self.http.get(url)).await
    }

    pub async fn list_tables(
        &self,
        project_id: &str,
        dataset_id: &str,
        raw_query: Option<&str>,
    ) -> Result<UpstreamResponse, WarehouseError> {
        let url = self.project_url(
            project_id,
            &format!("datasets/{}/tables", dataset_id),
            raw_query,
        );
        self.send("list_tables", self.http.get(url)).await
    }

    /// Path segments must already be validated by the caller. Only
    /// allowlisted client query parameters are forwarded.
    fn project_url(&self, project_id: &str, path: &str, raw_query: Option<&str>) -> String {
        let mut url = format!(
            "{}/bigquery/v2/projects/{}/{}",
            self.base_url, project_id, path
        );
        let query = raw_query.map(forwardable_query).unwrap_or_default();
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<UpstreamResponse, WarehouseError> {
        let result = self.send_inner(request).await;
        match &result {
            Ok(resp) => metrics::observe_upstream_request(operation, resp.status.as_str()),
            Err(err) => {
                metrics::observe_upstream_request(operation, err.metric_label());
                tracing::warn!(operation, error = %err, "warehouse request failed");
            }
        }
        result
    }

    async fn send_inner(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<UpstreamResponse, WarehouseError> {
        let authorization = self.tokens.authorization_header().await?;
        let resp = request
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await?;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = resp.bytes().await?.to_vec();

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Paging, location and formatting parameters the read endpoints accept.
/// Partial-response masks (`fields`) and transport overrides are dropped so
/// completion payloads always carry job state and byte counts.
const FORWARDED_PARAMS: &[&str] = &[
    "all",
    "filter",
    "location",
    "maxResults",
    "pageToken",
    "startIndex",
    "timeoutMs",
];

fn forwardable_query(raw: &str) -> String {
    raw.split('&')
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(name, _)| name);
            FORWARDED_PARAMS.contains(&name) || name.starts_with("formatOptions.")
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bqproxy_auth::{CredentialSource, TokenProviderConfig};

    fn client(base_url: &str) -> WarehouseClient {
        let tokens = AccessTokenProvider::new(TokenProviderConfig::new(CredentialSource::Static(
            "t".to_string(),
        )))
        .expect("tokens");
        WarehouseClient::new(
            WarehouseClientConfig {
                base_url: base_url.to_string(),
                timeout: Duration::from_secs(1),
            },
            tokens,
        )
        .expect("client")
    }

    #[test]
    fn project_url_appends_raw_query() {
        let c = client("https://warehouse.test/");
        assert_eq!(
            c.project_url("p1", "jobs/j1", Some("location=US&maxResults=10")),
            "https://warehouse.test/bigquery/v2/projects/p1/jobs/j1?location=US&maxResults=10"
        );
        assert_eq!(
            c.project_url("p1", "datasets", Some("")),
            "https://warehouse.test/bigquery/v2/projects/p1/datasets"
        );
    }

    #[test]
    fn response_masks_are_not_forwarded() {
        assert_eq!(
            forwardable_query("fields=jobReference,jobComplete,rows&maxResults=5"),
            "maxResults=5"
        );
        assert_eq!(
            forwardable_query("prettyPrint=false&fiel%64s=rows&$fields=rows&alt=proto"),
            ""
        );
        assert_eq!(
            forwardable_query("formatOptions.useInt64Timestamp=true&pageToken=abc&location=EU"),
            "formatOptions.useInt64Timestamp=true&pageToken=abc&location=EU"
        );

        let c = client("https://warehouse.test");
        assert_eq!(
            c.project_url("p1", "queries/j1", Some("fields=rows")),
            "https://warehouse.test/bigquery/v2/projects/p1/queries/j1"
        );
    }

    #[test]
    fn upstream_json_is_lenient() {
        let resp = UpstreamResponse {
            status: StatusCode::OK,
            content_type: None,
            body: b"not json".to_vec(),
        };
        assert!(resp.json().is_none());
    }

    #[tokio::test]
    async fn connection_refused_maps_to_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = client(&format!("http://{}", addr))
            .get_job("p1", "j1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Http(_)));
    }
}
