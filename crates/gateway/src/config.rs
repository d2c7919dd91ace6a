use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use bqproxy_auth::DEFAULT_METADATA_TOKEN_URL;
use bqproxy_quota::{CounterMode, DEFAULT_MARKER_TTL, DEFAULT_WINDOW};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub project_id: String,
    pub warehouse_base_url: String,
    pub warehouse_timeout_ms: u64,
    pub credentials: CredentialsConfig,
    pub allow_user_sql: bool,
    pub query_catalog_path: Option<PathBuf>,
    pub max_query_bytes: u64,
    pub daily_quota_gb: Option<f64>,
    pub quota_backend: QuotaBackend,
    pub redis_url: Option<String>,
    pub quota_mode: CounterMode,
    pub quota_key_prefix: String,
    pub quota_marker_ttl_secs: u64,
    pub quota_lock_ttl_ms: u64,
    pub quota_store_timeout_ms: u64,
    pub trust_forwarded_for: bool,
    /// Load balancers between the client and this proxy, each appending one
    /// `X-Forwarded-For` hop.
    pub trusted_proxy_hops: usize,
    pub enable_listing: bool,
    pub listing_projects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsConfig {
    StaticToken(String),
    ServiceAccountFile(PathBuf),
    MetadataServer { token_url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

const DEFAULT_MAX_QUERY_BYTES: u64 = 10 * 1024 * 1024 * 1024;

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("BQPROXY_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = match nonempty(kv, "BQPROXY_BIND_ADDR") {
            Some(_) => parse_socket_addr(
                kv.get("BQPROXY_BIND_ADDR"),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
                "BQPROXY_BIND_ADDR",
            )?,
            // App Engine style hosting only hands us a port.
            None => match nonempty(kv, "PORT") {
                Some(port) => {
                    let port = port.parse::<u16>().map_err(|_| StartupError {
                        code: "ERR_INVALID_CONFIG",
                        message: "PORT must be a valid port number".to_string(),
                    })?;
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
                }
                None => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            },
        };

        let project_id = require_nonempty(kv, "BQPROXY_PROJECT_ID")?;
        if !is_valid_project_id(&project_id) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "BQPROXY_PROJECT_ID must contain only lowercase letters, digits, '-', '.' or ':'"
                    .to_string(),
            });
        }

        let warehouse_base_url = nonempty(kv, "BQPROXY_WAREHOUSE_BASE_URL")
            .unwrap_or("https://bigquery.googleapis.com")
            .trim_end_matches('/')
            .to_string();
        if !(warehouse_base_url.starts_with("https://")
            || warehouse_base_url.starts_with("http://"))
        {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "BQPROXY_WAREHOUSE_BASE_URL must be an http(s) URL".to_string(),
            });
        }

        let warehouse_timeout_ms = parse_u64(
            kv.get("BQPROXY_WAREHOUSE_TIMEOUT_MS"),
            60_000,
            "BQPROXY_WAREHOUSE_TIMEOUT_MS",
        )?;

        let credentials = parse_credentials(kv)?;

        let allow_user_sql = parse_bool(kv.get("BQPROXY_ALLOW_USER_SQL"), false, "BQPROXY_ALLOW_USER_SQL")?;

        let query_catalog_path = nonempty(kv, "BQPROXY_QUERY_CATALOG_PATH").map(PathBuf::from);

        let max_query_bytes = parse_u64(
            kv.get("BQPROXY_MAX_QUERY_BYTES"),
            DEFAULT_MAX_QUERY_BYTES,
            "BQPROXY_MAX_QUERY_BYTES",
        )?;
        if max_query_bytes == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "BQPROXY_MAX_QUERY_BYTES must be >= 1".to_string(),
            });
        }

        let daily_quota_gb = parse_f64(kv.get("BQPROXY_DAILY_QUOTA_GB"), 0.0, "BQPROXY_DAILY_QUOTA_GB")?;
        if !daily_quota_gb.is_finite() || daily_quota_gb < 0.0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "BQPROXY_DAILY_QUOTA_GB must be a non-negative number".to_string(),
            });
        }
        let daily_quota_gb = (daily_quota_gb > 0.0).then_some(daily_quota_gb);

        let quota_backend = parse_quota_backend(kv.get("BQPROXY_QUOTA_BACKEND"))?;
        let redis_url = nonempty(kv, "BQPROXY_REDIS_URL").map(str::to_string);
        if daily_quota_gb.is_some() && quota_backend == QuotaBackend::Redis && redis_url.is_none() {
            return Err(StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "BQPROXY_DAILY_QUOTA_GB with the redis backend requires BQPROXY_REDIS_URL"
                    .to_string(),
            });
        }

        let quota_mode = parse_quota_mode(kv.get("BQPROXY_QUOTA_MODE"))?;

        let quota_key_prefix = nonempty(kv, "BQPROXY_QUOTA_KEY_PREFIX")
            .unwrap_or("bqproxy")
            .to_string();

        let quota_marker_ttl_secs = parse_u64(
            kv.get("BQPROXY_QUOTA_MARKER_TTL_SECS"),
            DEFAULT_MARKER_TTL.as_secs(),
            "BQPROXY_QUOTA_MARKER_TTL_SECS",
        )?;
        let quota_lock_ttl_ms = parse_u64(
            kv.get("BQPROXY_QUOTA_LOCK_TTL_MS"),
            3000,
            "BQPROXY_QUOTA_LOCK_TTL_MS",
        )?;
        let quota_store_timeout_ms = parse_u64(
            kv.get("BQPROXY_QUOTA_STORE_TIMEOUT_MS"),
            500,
            "BQPROXY_QUOTA_STORE_TIMEOUT_MS",
        )?;
        if quota_marker_ttl_secs == 0 || quota_lock_ttl_ms == 0 || quota_store_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "quota marker, lock and store timeouts must be >= 1".to_string(),
            });
        }
        if quota_marker_ttl_secs < DEFAULT_WINDOW.as_secs() {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!(
                    "BQPROXY_QUOTA_MARKER_TTL_SECS must be at least the {}s usage window",
                    DEFAULT_WINDOW.as_secs()
                ),
            });
        }

        let trust_forwarded_for = parse_bool(
            kv.get("BQPROXY_TRUST_FORWARDED_FOR"),
            true,
            "BQPROXY_TRUST_FORWARDED_FOR",
        )?;
        let trusted_proxy_hops = parse_u64(
            kv.get("BQPROXY_TRUSTED_PROXY_HOPS"),
            1,
            "BQPROXY_TRUSTED_PROXY_HOPS",
        )?;
        if !(1..=16).contains(&trusted_proxy_hops) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "BQPROXY_TRUSTED_PROXY_HOPS must be between 1 and 16".to_string(),
            });
        }
        let trusted_proxy_hops = trusted_proxy_hops as usize;

        let enable_listing =
            parse_bool(kv.get("BQPROXY_ENABLE_LISTING"), false, "BQPROXY_ENABLE_LISTING")?;

        let mut listing_projects = nonempty(kv, "BQPROXY_LISTING_PROJECTS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| vec![project_id.clone()]);
        listing_projects.sort();
        listing_projects.dedup();
        if let Some(bad) = listing_projects.iter().find(|p| !is_valid_project_id(p)) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!("BQPROXY_LISTING_PROJECTS contains invalid project id {}", bad),
            });
        }

        Ok(Self {
            bind_addr,
            project_id,
            warehouse_base_url,
            warehouse_timeout_ms,
            credentials,
            allow_user_sql,
            query_catalog_path,
            max_query_bytes,
            daily_quota_gb,
            quota_backend,
            redis_url,
            quota_mode,
            quota_key_prefix,
            quota_marker_ttl_secs,
            quota_lock_ttl_ms,
            quota_store_timeout_ms,
            trust_forwarded_for,
            trusted_proxy_hops,
            enable_listing,
            listing_projects,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn nonempty<'a>(kv: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    kv.get(key).map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    nonempty(kv, key)
        .map(str::to_string)
        .ok_or_else(|| StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        })
}

fn parse_credentials(kv: &HashMap<String, String>) -> Result<CredentialsConfig, StartupError> {
    let static_token = nonempty(kv, "BQPROXY_STATIC_ACCESS_TOKEN");
    let file_needed = parse_bool(
        kv.get("BQPROXY_CREDENTIALS_FILE_NEEDED"),
        false,
        "BQPROXY_CREDENTIALS_FILE_NEEDED",
    )?;

    match (static_token, file_needed) {
        (Some(_), true) => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "BQPROXY_STATIC_ACCESS_TOKEN cannot be combined with BQPROXY_CREDENTIALS_FILE_NEEDED"
                .to_string(),
        }),
        (Some(token), false) => Ok(CredentialsConfig::StaticToken(token.to_string())),
        (None, true) => Ok(CredentialsConfig::ServiceAccountFile(PathBuf::from(
            require_nonempty(kv, "BQPROXY_CREDENTIALS_FILE")?,
        ))),
        (None, false) => Ok(CredentialsConfig::MetadataServer {
            token_url: nonempty(kv, "BQPROXY_METADATA_TOKEN_URL")
                .unwrap_or(DEFAULT_METADATA_TOKEN_URL)
                .to_string(),
        }),
    }
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_f64(value: Option<&String>, default: f64, key: &'static str) -> Result<f64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<f64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a number", key),
        }),
    }
}

fn parse_bool(value: Option<&String>, default: bool, key: &'static str) -> Result<bool, StartupError> {
    let Some(value) = value.map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(default);
    };

    match value {
        "1" | "true" | "TRUE" | "True" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "False" | "no" | "NO" => Ok(false),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be true or false", key),
        }),
    }
}

fn parse_quota_backend(value: Option<&String>) -> Result<QuotaBackend, StartupError> {
    let backend = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("redis");

    match backend {
        "redis" => Ok(QuotaBackend::Redis),
        "memory" => Ok(QuotaBackend::Memory),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "BQPROXY_QUOTA_BACKEND must be redis or memory".to_string(),
        }),
    }
}

fn parse_quota_mode(value: Option<&String>) -> Result<CounterMode, StartupError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("atomic");

    match mode {
        "atomic" => Ok(CounterMode::Atomic),
        "legacy-lock" => Ok(CounterMode::LegacyLock),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "BQPROXY_QUOTA_MODE must be atomic or legacy-lock".to_string(),
        }),
    }
}

fn is_valid_project_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b':'))
}
