//! Helpers over warehouse job payloads.
//!
//! Jobs stay `serde_json::Value` end to end so fields this proxy does not
//! understand are forwarded untouched.

use serde_json::{Map, Value};

/// The warehouse encodes int64 fields as JSON strings; numbers are accepted too.
pub fn parse_int64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse::<u64>().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

pub fn job_id(job: &Value) -> Option<&str> {
    job.get("jobReference")
        .and_then(|r| r.get("jobId"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Estimated bytes from a dry-run job resource.
pub fn dry_run_estimate(job: &Value) -> Option<u64> {
    let statistics = job.get("statistics")?;
    statistics
        .get("totalBytesProcessed")
        .and_then(parse_int64)
        .or_else(|| {
            statistics
                .get("query")
                .and_then(|q| q.get("totalBytesProcessed"))
                .and_then(parse_int64)
        })
}

/// Forces `jobReference.projectId` when the client supplied a job reference.
pub fn pin_project(job: &mut Value, project_id: &str) {
    if let Some(reference) = job.get_mut("jobReference").and_then(Value::as_object_mut) {
        reference.insert(
            "projectId".to_string(),
            Value::String(project_id.to_string()),
        );
    }
}

/// Copy of `job` configured as a cache-less dry run. The job id is dropped so
/// the real submission can still claim it.
pub fn prepare_dry_run(job: &Value) -> Value {
    let mut dry = job.clone();
    if let Some(reference) = dry.get_mut("jobReference").and_then(Value::as_object_mut) {
        reference.remove("jobId");
    }
    if let Some(configuration) = configuration_mut(&mut dry) {
        configuration.insert("dryRun".to_string(), Value::Bool(true));
        if let Some(query) = configuration.get_mut("query").and_then(Value::as_object_mut) {
            query.insert("useQueryCache".to_string(), Value::Bool(false));
        }
    }
    dry
}

/// Copy of `job` configured for real execution with the query cache enabled.
pub fn prepare_execution(job: &Value) -> Value {
    let mut run = job.clone();
    if let Some(configuration) = configuration_mut(&mut run) {
        configuration.remove("dryRun");
        if let Some(query) = configuration.get_mut("query").and_then(Value::as_object_mut) {
            query.insert("useQueryCache".to_string(), Value::Bool(true));
        }
    }
    run
}

fn configuration_mut(job: &mut Value) -> Option<&mut Map<String, Value>> {
    job.get_mut("configuration").and_then(Value::as_object_mut)
}

/// A finished job as one payload reports it. `bytes_processed` is `None`
/// when the payload does not carry a byte count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub job_id: String,
    pub bytes_processed: Option<u64>,
}

impl JobCompletion {
    /// Reads a job resource (`jobs.insert` / `jobs.get`) for the job the
    /// caller addressed. Returns `None` until the job reports `DONE`.
    pub fn from_job_resource(job: &Value, job_id: &str) -> Option<Self> {
        let state = job
            .get("status")
            .and_then(|s| s.get("state"))
            .and_then(Value::as_str)?;
        if state != "DONE" {
            return None;
        }

        let bytes_processed = job
            .get("statistics")
            .and_then(|s| {
                s.get("totalBytesProcessed").or_else(|| {
                    s.get("query")
                        .and_then(|q| q.get("totalBytesProcessed"))
                })
            })
            .and_then(parse_int64);

        Some(Self {
            job_id: job_id.to_string(),
            bytes_processed,
        })
    }

    /// Reads a `getQueryResults` payload. Returns `None` while `jobComplete` is
    /// false.
    pub fn from_query_results(results: &Value, job_id: &str) -> Option<Self> {
        if !results
            .get("jobComplete")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return None;
        }

        Some(Self {
            job_id: job_id.to_string(),
            bytes_processed: results.get("totalBytesProcessed").and_then(parse_int64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dry_run_estimate_reads_top_level_or_query_statistics() {
        let top = json!({"statistics": {"totalBytesProcessed": "1024"}});
        assert_eq!(dry_run_estimate(&top), Some(1024));

        let nested = json!({"statistics": {"query": {"totalBytesProcessed": 77}}});
        assert_eq!(dry_run_estimate(&nested), Some(77));

        let missing = json!({"statistics": {}});
        assert_eq!(dry_run_estimate(&missing), None);
    }

    #[test]
    fn prepare_dry_run_disables_cache_and_drops_job_id() {
        let job = json!({
            "jobReference": {"projectId": "p", "jobId": "j1", "location": "US"},
            "configuration": {"query": {"query": "SELECT 1", "useQueryCache": true}}
        });

        let dry = prepare_dry_run(&job);
        assert_eq!(dry["configuration"]["dryRun"], json!(true));
        assert_eq!(dry["configuration"]["query"]["useQueryCache"], json!(false));
        assert_eq!(dry["jobReference"], json!({"projectId": "p", "location": "US"}));
    }

    #[test]
    fn prepare_execution_clears_dry_run_and_keeps_job_id() {
        let job = json!({
            "jobReference": {"projectId": "p", "jobId": "j1"},
            "configuration": {"dryRun": true, "query": {"query": "SELECT 1"}}
        });

        let run = prepare_execution(&job);
        assert!(run["configuration"].get("dryRun").is_none());
        assert_eq!(run["configuration"]["query"]["useQueryCache"], json!(true));
        assert_eq!(job_id(&run), Some("j1"));
    }

    #[test]
    fn pin_project_only_touches_existing_reference() {
        let mut with_ref = json!({"jobReference": {"projectId": "other", "jobId": "j"}});
        pin_project(&mut with_ref, "mine");
        assert_eq!(with_ref["jobReference"]["projectId"], json!("mine"));

        let mut without_ref = json!({"configuration": {}});
        pin_project(&mut without_ref, "mine");
        assert!(without_ref.get("jobReference").is_none());
    }

    #[test]
    fn completion_requires_done_state() {
        let running = json!({
            "jobReference": {"jobId": "j"},
            "status": {"state": "RUNNING"},
            "statistics": {"totalBytesProcessed": "10"}
        });
        assert_eq!(JobCompletion::from_job_resource(&running, "j"), None);

        let done = json!({
            "jobReference": {"jobId": "j"},
            "status": {"state": "DONE"},
            "statistics": {"totalBytesProcessed": "10"}
        });
        assert_eq!(
            JobCompletion::from_job_resource(&done, "j"),
            Some(JobCompletion {
                job_id: "j".to_string(),
                bytes_processed: Some(10)
            })
        );
    }

    #[test]
    fn completion_from_query_results_requires_job_complete() {
        let pending = json!({"jobReference": {"jobId": "j"}, "jobComplete": false});
        assert_eq!(JobCompletion::from_query_results(&pending, "j"), None);

        let complete = json!({
            "jobReference": {"jobId": "j"},
            "jobComplete": true,
            "totalBytesProcessed": "2048"
        });
        assert_eq!(
            JobCompletion::from_query_results(&complete, "j").and_then(|c| c.bytes_processed),
            Some(2048)
        );
    }

    #[test]
    fn masked_payloads_report_an_unknown_byte_count() {
        let results = json!({"jobReference": {"jobId": "j"}, "jobComplete": true, "rows": []});
        assert_eq!(
            JobCompletion::from_query_results(&results, "j"),
            Some(JobCompletion {
                job_id: "j".to_string(),
                bytes_processed: None
            })
        );

        // no jobReference: the addressed id still identifies the job
        let job = json!({"status": {"state": "DONE"}, "statistics": {"totalBytesProcessed": "7"}});
        assert_eq!(
            JobCompletion::from_job_resource(&job, "j"),
            Some(JobCompletion {
                job_id: "j".to_string(),
                bytes_processed: Some(7)
            })
        );
    }
}
