use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// The fields of a service-account key file that the JWT bearer grant needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_json_str(raw: &str) -> Result<Self, AuthError> {
        serde_json::from_str::<Self>(raw).map_err(|_| AuthError {
            code: "ERR_INVALID_CONFIG",
            message: "service account key file is not valid JSON with client_email and private_key"
                .to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let raw = std::fs::read_to_string(path).map_err(|_| AuthError {
            code: "ERR_INVALID_CONFIG",
            message: format!("failed to read credentials file at {}", path.display()),
        })?;
        Self::from_json_str(&raw)
    }
}

#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Fixed bearer token; never refreshed.
    Static(String),
    ServiceAccount(ServiceAccountKey),
    MetadataServer { token_url: String },
}

impl CredentialSource {
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialSource::Static(_) => "static",
            CredentialSource::ServiceAccount(_) => "service_account",
            CredentialSource::MetadataServer { .. } => "metadata_server",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenProviderConfig {
    pub source: CredentialSource,
    pub scope: String,
    pub http_timeout: Duration,
    /// Tokens are refreshed this long before they expire.
    pub refresh_margin: Duration,
}

impl TokenProviderConfig {
    pub fn new(source: CredentialSource) -> Self {
        Self {
            source,
            scope: CLOUD_PLATFORM_SCOPE.to_string(),
            http_timeout: Duration::from_secs(10),
            refresh_margin: Duration::from_secs(60),
        }
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Hands out bearer tokens for the warehouse API, refreshing them shortly
/// before they expire.
#[derive(Clone)]
pub struct AccessTokenProvider {
    source: Arc<CredentialSource>,
    signing_key: Option<Arc<EncodingKey>>,
    scope: String,
    refresh_margin: Duration,
    http: reqwest::Client,
    cache: Arc<RwLock<Option<CachedToken>>>,
}

impl AccessTokenProvider {
    pub fn new(config: TokenProviderConfig) -> Result<Self, AuthError> {
        let signing_key = match &config.source {
            CredentialSource::Static(token) if token.trim().is_empty() => {
                return Err(AuthError {
                    code: "ERR_INVALID_CONFIG",
                    message: "static access token must be non-empty".to_string(),
                });
            }
            CredentialSource::ServiceAccount(key) => Some(Arc::new(
                EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|_| AuthError {
                    code: "ERR_INVALID_CONFIG",
                    message: "service account private_key is not a valid RSA PEM key".to_string(),
                })?,
            )),
            _ => None,
        };

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|_| AuthError {
                code: "ERR_INTERNAL",
                message: "failed to initialize credentials http client".to_string(),
            })?;

        Ok(Self {
            source: Arc::new(config.source),
            signing_key,
            scope: config.scope,
            refresh_margin: config.refresh_margin,
            http,
            cache: Arc::new(RwLock::new(None)),
        })
    }

    pub fn source_kind(&self) -> &'static str {
        self.source.kind()
    }

    pub async fn access_token(&self) -> Result<String, AuthError> {
        if let CredentialSource::Static(token) = self.source.as_ref() {
            return Ok(token.clone());
        }

        {
            let cache = self.cache.read().await;
            if let Some(token) = cache.as_ref().and_then(|t| self.usable(t)) {
                return Ok(token);
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(token) = cache.as_ref().and_then(|t| self.usable(t)) {
            return Ok(token);
        }

        let fetched = self.fetch().await?;
        let token = fetched.access_token.clone();
        *cache = Some(fetched);
        Ok(token)
    }

    pub async fn authorization_header(&self) -> Result<String, AuthError> {
        Ok(format!("Bearer {}", self.access_token().await?))
    }

    fn usable(&self, token: &CachedToken) -> Option<String> {
        (token.expires_at > Instant::now() + self.refresh_margin)
            .then(|| token.access_token.clone())
    }

    async fn fetch(&self) -> Result<CachedToken, AuthError> {
        let started = Instant::now();
        let request = match self.source.as_ref() {
            CredentialSource::Static(token) => {
                return Ok(CachedToken {
                    access_token: token.clone(),
                    expires_at: started + Duration::from_secs(ASSERTION_LIFETIME_SECS),
                });
            }
            CredentialSource::ServiceAccount(key) => {
                let assertion = self.sign_assertion(key)?;
                self.http.post(&key.token_uri).form(&[
                    ("grant_type", JWT_BEARER_GRANT),
                    ("assertion", assertion.as_str()),
                ])
            }
            CredentialSource::MetadataServer { token_url } => self
                .http
                .get(token_url)
                .header("Metadata-Flavor", "Google"),
        };

        let response = request.send().await.map_err(|err| AuthError {
            code: "ERR_CREDENTIALS_UNAVAILABLE",
            message: format!("token endpoint request failed: {}", err),
        })?;

        if !response.status().is_success() {
            return Err(AuthError {
                code: "ERR_CREDENTIALS_UNAVAILABLE",
                message: format!("token endpoint returned status {}", response.status()),
            });
        }

        let decoded = response
            .json::<TokenResponse>()
            .await
            .map_err(|_| AuthError {
                code: "ERR_CREDENTIALS_INVALID",
                message: "token endpoint returned an invalid response".to_string(),
            })?;

        let lifetime = Duration::from_secs(decoded.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS));
        tracing::debug!(
            source = self.source.kind(),
            expires_in_secs = lifetime.as_secs(),
            "refreshed warehouse access token"
        );

        Ok(CachedToken {
            access_token: decoded.access_token,
            expires_at: started + lifetime,
        })
    }

    fn sign_assertion(&self, key: &ServiceAccountKey) -> Result<String, AuthError> {
        let signing_key = self.signing_key.as_ref().ok_or_else(|| AuthError {
            code: "ERR_INTERNAL",
            message: "service account signing key is not initialized".to_string(),
        })?;

        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        let mut header = Header::new(Algorithm::RS256);
        header.kid = key.private_key_id.clone();

        let claims = AssertionClaims {
            iss: key.client_email.as_str(),
            scope: self.scope.as_str(),
            aud: key.token_uri.as_str(),
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        encode(&header, &claims, signing_key).map_err(|_| AuthError {
            code: "ERR_CREDENTIALS_INVALID",
            message: "failed to sign service account assertion".to_string(),
        })
    }
}
