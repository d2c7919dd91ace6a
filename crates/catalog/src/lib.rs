use std::collections::BTreeMap;
use std::path::Path;

use bqproxy_contracts::canonical;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod builtin;

/// Name of the query parameter clients use to select a catalog entry.
pub const QUERY_ID_PARAM: &str = "queryid";

const MAX_QUERY_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryDefinition {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogError {
    message: String,
}

impl CatalogError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CatalogError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    NotAnObject,
    NotAQueryJob,
    InvalidParameters(&'static str),
    MissingQueryId,
    UnrecognizedQueryId,
    UnexpectedParameter(String),
    MissingParameter(String),
}

impl RewriteError {
    /// Stable label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            RewriteError::NotAnObject => "not_an_object",
            RewriteError::NotAQueryJob => "not_a_query_job",
            RewriteError::InvalidParameters(_) => "invalid_parameters",
            RewriteError::MissingQueryId => "missing_query_id",
            RewriteError::UnrecognizedQueryId => "unrecognized_query_id",
            RewriteError::UnexpectedParameter(_) => "unexpected_parameter",
            RewriteError::MissingParameter(_) => "missing_parameter",
        }
    }
}

impl std::fmt::Display for RewriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewriteError::NotAnObject => write!(f, "request body must be a JSON object"),
            RewriteError::NotAQueryJob => write!(f, "only query jobs are accepted"),
            RewriteError::InvalidParameters(detail) => write!(f, "{}", detail),
            RewriteError::MissingQueryId => write!(f, "missing query id"),
            RewriteError::UnrecognizedQueryId => write!(f, "unrecognized query id"),
            RewriteError::UnexpectedParameter(name) => {
                write!(f, "unexpected query parameter '{}'", name)
            }
            RewriteError::MissingParameter(name) => {
                write!(f, "missing query parameter '{}'", name)
            }
        }
    }
}

impl std::error::Error for RewriteError {}

/// Where the SQL of a rewritten job came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    Catalog { query_id: String },
    UserSql,
}

impl QuerySource {
    pub fn query_id(&self) -> Option<&str> {
        match self {
            QuerySource::Catalog { query_id } => Some(query_id.as_str()),
            QuerySource::UserSql => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryCatalog {
    queries: BTreeMap<String, QueryDefinition>,
}

impl QueryCatalog {
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        for (id, definition) in builtin::builtin_queries() {
            catalog.queries.insert(id.to_string(), definition);
        }
        catalog
    }

    /// Built-in queries, overlaid with the entries of the JSON file at `path`.
    pub fn load(path: Option<&Path>) -> Result<Self, CatalogError> {
        let mut catalog = Self::builtin();
        if let Some(path) = path {
            let contents = std::fs::read_to_string(path).map_err(|_| {
                CatalogError::new(format!(
                    "failed to read query catalog at {}",
                    path.display()
                ))
            })?;
            catalog.merge(Self::from_json_str(&contents)?);
        }
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let queries = serde_json::from_str::<BTreeMap<String, QueryDefinition>>(raw)
            .map_err(|err| CatalogError::new(format!("invalid query catalog JSON: {}", err)))?;
        let catalog = Self { queries };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn merge(&mut self, other: QueryCatalog) {
        self.queries.extend(other.queries);
    }

    pub fn get(&self, query_id: &str) -> Option<&QueryDefinition> {
        self.queries.get(query_id)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.queries.keys().map(String::as_str)
    }

    pub fn fingerprint(&self) -> String {
        let value = serde_json::to_value(&self.queries).unwrap_or(Value::Null);
        canonical::hash_canonical_json(&value)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for (id, definition) in &self.queries {
            if id.is_empty()
                || id.len() > MAX_QUERY_ID_LEN
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            {
                return Err(CatalogError::new(format!("invalid query id '{}'", id)));
            }
            if definition.sql.trim().is_empty() {
                return Err(CatalogError::new(format!("query '{}' has empty sql", id)));
            }
            for (idx, param) in definition.params.iter().enumerate() {
                if param == QUERY_ID_PARAM {
                    return Err(CatalogError::new(format!(
                        "query '{}' declares reserved parameter '{}'",
                        id, QUERY_ID_PARAM
                    )));
                }
                if definition.params[..idx].contains(param) {
                    return Err(CatalogError::new(format!(
                        "query '{}' declares parameter '{}' twice",
                        id, param
                    )));
                }
                if !definition.sql.contains(&format!("@{}", param)) {
                    return Err(CatalogError::new(format!(
                        "query '{}' declares parameter '{}' but its sql never references @{}",
                        id, param, param
                    )));
                }
            }
        }
        Ok(())
    }

    /// Replaces the client's SQL with the catalog entry its `queryid`
    /// parameter names and strips that parameter. Without a query id the job
    /// is only accepted when `allow_user_sql` is set and carries SQL text.
    pub fn rewrite(
        &self,
        job: &mut Value,
        allow_user_sql: bool,
    ) -> Result<QuerySource, RewriteError> {
        let Some(job) = job.as_object_mut() else {
            return Err(RewriteError::NotAnObject);
        };
        let Some(query) = job
            .get_mut("configuration")
            .and_then(Value::as_object_mut)
            .and_then(|c| c.get_mut("query"))
            .and_then(Value::as_object_mut)
        else {
            return Err(RewriteError::NotAQueryJob);
        };

        let params = match query.remove("queryParameters") {
            None => Vec::new(),
            Some(Value::Array(params)) => params,
            Some(_) => {
                return Err(RewriteError::InvalidParameters(
                    "queryParameters must be an array",
                ));
            }
        };

        let mut query_ids = Vec::new();
        let mut remaining = Vec::with_capacity(params.len());
        for param in params {
            if param_name(&param) == Some(QUERY_ID_PARAM) {
                query_ids.push(param);
            } else {
                remaining.push(param);
            }
        }

        match query_ids.as_slice() {
            [] => {
                let has_sql = query
                    .get("query")
                    .and_then(Value::as_str)
                    .is_some_and(|sql| !sql.trim().is_empty());
                if !allow_user_sql || !has_sql {
                    return Err(RewriteError::MissingQueryId);
                }
                restore_params(query, remaining);
                Ok(QuerySource::UserSql)
            }
            [selector] => {
                let query_id = selector
                    .get("parameterValue")
                    .and_then(|v| v.get("value"))
                    .and_then(Value::as_str)
                    .ok_or(RewriteError::UnrecognizedQueryId)?;
                let definition = self
                    .get(query_id)
                    .ok_or(RewriteError::UnrecognizedQueryId)?;

                for param in &remaining {
                    let name = param_name(param).ok_or(RewriteError::InvalidParameters(
                        "query parameters must be named",
                    ))?;
                    if !definition.params.iter().any(|p| p == name) {
                        return Err(RewriteError::UnexpectedParameter(name.to_string()));
                    }
                }
                for declared in &definition.params {
                    if !remaining
                        .iter()
                        .any(|p| param_name(p) == Some(declared.as_str()))
                    {
                        return Err(RewriteError::MissingParameter(declared.clone()));
                    }
                }

                query.insert("query".to_string(), Value::String(definition.sql.clone()));
                query.insert("useLegacySql".to_string(), Value::Bool(false));
                restore_params(query, remaining);

                Ok(QuerySource::Catalog {
                    query_id: query_id.to_string(),
                })
            }
            _ => Err(RewriteError::InvalidParameters(
                "only one queryid parameter may be supplied",
            )),
        }
    }
}

fn param_name(param: &Value) -> Option<&str> {
    param.get("name").and_then(Value::as_str)
}

fn restore_params(query: &mut Map<String, Value>, params: Vec<Value>) {
    if params.is_empty() {
        return;
    }
    query
        .entry("parameterMode")
        .or_insert_with(|| Value::String("NAMED".to_string()));
    query.insert("queryParameters".to_string(), Value::Array(params));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query_id_param(id: &str) -> Value {
        json!({
            "name": "queryid",
            "parameterType": {"type": "STRING"},
            "parameterValue": {"value": id}
        })
    }

    fn genelist_param() -> Value {
        json!({
            "name": "genelist",
            "parameterType": {"type": "ARRAY", "arrayType": {"type": "STRING"}},
            "parameterValue": {"arrayValues": [{"value": "ACVR1"}, {"value": "APC"}]}
        })
    }

    fn job_with_params(sql: &str, params: Vec<Value>) -> Value {
        json!({
            "jobReference": {"projectId": "client", "jobId": "job-1"},
            "configuration": {
                "query": {
                    "query": sql,
                    "queryParameters": params,
                    "useLegacySql": false
                }
            }
        })
    }

    #[test]
    fn builtin_catalog_contains_heatmap_queries() {
        let catalog = QueryCatalog::builtin();
        assert_eq!(catalog.ids().collect::<Vec<_>>(), vec!["hm1", "hm2"]);
        assert_eq!(
            catalog.get("hm1").expect("hm1").params,
            vec!["genelist".to_string()]
        );
        catalog.validate().expect("builtin catalog is valid");
    }

    #[test]
    fn rewrite_substitutes_catalog_sql_and_strips_query_id() {
        let catalog = QueryCatalog::builtin();
        let mut job = job_with_params(
            "DROP TABLE everything",
            vec![query_id_param("hm1"), genelist_param()],
        );

        let source = catalog.rewrite(&mut job, false).expect("rewrite succeeds");
        assert_eq!(source.query_id(), Some("hm1"));

        let query = &job["configuration"]["query"];
        assert_eq!(query["query"], json!(catalog.get("hm1").expect("hm1").sql));
        assert_eq!(query["queryParameters"], json!([genelist_param()]));
        assert_eq!(query["parameterMode"], json!("NAMED"));
        assert_eq!(job["jobReference"]["jobId"], json!("job-1"));
    }

    #[test]
    fn rewrite_removes_parameter_list_when_only_query_id_was_sent() {
        let catalog = QueryCatalog::builtin();
        let mut job = job_with_params("", vec![query_id_param("hm2")]);

        catalog.rewrite(&mut job, false).expect("rewrite succeeds");
        assert!(job["configuration"]["query"].get("queryParameters").is_none());
    }

    #[test]
    fn rewrite_rejects_unknown_query_id() {
        let catalog = QueryCatalog::builtin();
        let mut job = job_with_params("", vec![query_id_param("nope")]);

        let err = catalog.rewrite(&mut job, true).unwrap_err();
        assert_eq!(err, RewriteError::UnrecognizedQueryId);
        assert_eq!(err.to_string(), "unrecognized query id");
    }

    #[test]
    fn rewrite_rejects_non_string_query_id() {
        let catalog = QueryCatalog::builtin();
        let mut job = job_with_params(
            "",
            vec![json!({"name": "queryid", "parameterValue": {"arrayValues": []}})],
        );

        assert_eq!(
            catalog.rewrite(&mut job, false).unwrap_err(),
            RewriteError::UnrecognizedQueryId
        );
    }

    #[test]
    fn rewrite_rejects_undeclared_and_missing_parameters() {
        let catalog = QueryCatalog::builtin();

        let mut extra = job_with_params(
            "",
            vec![
                query_id_param("hm1"),
                genelist_param(),
                json!({"name": "limit", "parameterValue": {"value": "5"}}),
            ],
        );
        assert_eq!(
            catalog.rewrite(&mut extra, false).unwrap_err(),
            RewriteError::UnexpectedParameter("limit".to_string())
        );

        let mut missing = job_with_params("", vec![query_id_param("hm1")]);
        assert_eq!(
            catalog.rewrite(&mut missing, false).unwrap_err(),
            RewriteError::MissingParameter("genelist".to_string())
        );
    }

    #[test]
    fn rewrite_without_query_id_depends_on_user_sql_toggle() {
        let catalog = QueryCatalog::builtin();

        let mut denied = job_with_params("SELECT 1", Vec::new());
        assert_eq!(
            catalog.rewrite(&mut denied, false).unwrap_err(),
            RewriteError::MissingQueryId
        );

        let mut allowed = job_with_params("SELECT 1", Vec::new());
        assert_eq!(
            catalog.rewrite(&mut allowed, true).expect("user sql allowed"),
            QuerySource::UserSql
        );
        assert_eq!(allowed["configuration"]["query"]["query"], json!("SELECT 1"));

        let mut empty = job_with_params("  ", Vec::new());
        assert_eq!(
            catalog.rewrite(&mut empty, true).unwrap_err(),
            RewriteError::MissingQueryId
        );
    }

    #[test]
    fn rewrite_rejects_non_query_jobs_and_duplicate_selectors() {
        let catalog = QueryCatalog::builtin();

        let mut load = json!({"configuration": {"load": {}}});
        assert_eq!(
            catalog.rewrite(&mut load, false).unwrap_err(),
            RewriteError::NotAQueryJob
        );

        let mut not_object = json!([1, 2]);
        assert_eq!(
            catalog.rewrite(&mut not_object, false).unwrap_err(),
            RewriteError::NotAnObject
        );

        let mut twice = job_with_params("", vec![query_id_param("hm2"), query_id_param("hm2")]);
        assert_eq!(
            catalog.rewrite(&mut twice, false).unwrap_err().reason(),
            "invalid_parameters"
        );
    }

    #[test]
    fn catalog_file_entries_override_builtins() {
        let mut catalog = QueryCatalog::builtin();
        let before = catalog.fingerprint();
        let extra = QueryCatalog::from_json_str(
            r#"{"hm2": {"sql": "SELECT @gene", "params": ["gene"]}, "cnv1": {"sql": "SELECT 1"}}"#,
        )
        .expect("catalog parses");
        catalog.merge(extra);

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get("hm2").expect("hm2").params, vec!["gene".to_string()]);
        assert_ne!(catalog.fingerprint(), before);
    }

    #[test]
    fn catalog_rejects_unreferenced_or_reserved_parameters() {
        let unreferenced =
            QueryCatalog::from_json_str(r#"{"q": {"sql": "SELECT 1", "params": ["gene"]}}"#)
                .unwrap_err();
        assert!(unreferenced.to_string().contains("never references @gene"));

        let reserved = QueryCatalog::from_json_str(
            r#"{"q": {"sql": "SELECT @queryid", "params": ["queryid"]}}"#,
        )
        .unwrap_err();
        assert!(reserved.to_string().contains("reserved parameter"));

        let bad_id = QueryCatalog::from_json_str(r#"{"a b": {"sql": "SELECT 1"}}"#).unwrap_err();
        assert!(bad_id.to_string().contains("invalid query id"));
    }
}
