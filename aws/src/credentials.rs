//! AWS credentials and where they are resolved from.
//!
//! The source is picked once at startup, in this order:
//!
//! 1. `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY` (plus `AWS_SESSION_TOKEN`)
//! 2. The ECS container credentials endpoint, when
//!    `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI` or
//!    `AWS_CONTAINER_CREDENTIALS_FULL_URI` is set (the task role)
//! 3. The EC2 instance metadata service (the instance profile), unless
//!    `AWS_EC2_METADATA_DISABLED=true`
//!
//! Credentials of the endpoint sources expire. [`CredentialsProvider`] caches
//! them and fetches new ones shortly before they do.

use crate::error::AwsError;
use chrono::{
    DateTime,
    Duration as TimeDelta,
    Utc,
};
use reqwest::{
    header::AUTHORIZATION,
    RequestBuilder,
};
use serde::Deserialize;
use std::{
    fmt,
    time::Duration,
};
use tokio::sync::Mutex;
use url::Url;

pub const ACCESS_KEY_ID_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_ACCESS_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
pub const SESSION_TOKEN_ENV: &str = "AWS_SESSION_TOKEN";
pub const CONTAINER_RELATIVE_URI_ENV: &str = "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI";
pub const CONTAINER_FULL_URI_ENV: &str = "AWS_CONTAINER_CREDENTIALS_FULL_URI";
pub const CONTAINER_AUTHORIZATION_ENV: &str = "AWS_CONTAINER_AUTHORIZATION_TOKEN";
pub const METADATA_DISABLED_ENV: &str = "AWS_EC2_METADATA_DISABLED";
pub const METADATA_ENDPOINT_ENV: &str = "AWS_EC2_METADATA_SERVICE_ENDPOINT";

const CONTAINER_ENDPOINT: &str = "http://169.254.170.2";
const METADATA_ENDPOINT: &str = "http://169.254.169.254";
const METADATA_TOKEN_PATH: &str = "/latest/api/token";
const METADATA_ROLES_PATH: &str = "/latest/meta-data/iam/security-credentials/";
const METADATA_TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
const METADATA_TOKEN_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const METADATA_TOKEN_TTL_SECONDS: &str = "21600";

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);
/// Cached credentials are replaced once they expire within this many seconds.
const REFRESH_MARGIN_SECONDS: i64 = 300;

#[derive(Clone)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at - TimeDelta::seconds(REFRESH_MARGIN_SECONDS) <= now)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Keys taken from the environment as they are.
    Static(Credentials),
    /// The ECS container credentials endpoint.
    Container { uri: Url, authorization: Option<String> },
    /// The EC2 instance metadata service, IMDSv2 with a fallback to v1.
    InstanceMetadata { endpoint: Url },
}

impl CredentialSource {
    pub fn from_env() -> Result<Self, AwsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AwsError> {
        let non_empty = |name: &'static str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(access_key_id) = non_empty(ACCESS_KEY_ID_ENV) {
            let secret_access_key =
                non_empty(SECRET_ACCESS_KEY_ENV).ok_or(AwsError::MissingCredentials(SECRET_ACCESS_KEY_ENV))?;
            return Ok(Self::Static(Credentials::new(
                access_key_id,
                secret_access_key,
                non_empty(SESSION_TOKEN_ENV),
            )));
        }

        let container_uri = match (non_empty(CONTAINER_RELATIVE_URI_ENV), non_empty(CONTAINER_FULL_URI_ENV)) {
            (Some(relative), _) => Some(format!("{CONTAINER_ENDPOINT}{relative}")),
            (None, full) => full,
        };
        if let Some(uri) = container_uri {
            return Ok(Self::Container {
                uri: parse_url(&uri)?,
                authorization: non_empty(CONTAINER_AUTHORIZATION_ENV),
            });
        }

        if non_empty(METADATA_DISABLED_ENV).is_some_and(|value| value.trim().eq_ignore_ascii_case("true")) {
            return Err(AwsError::MissingCredentials(ACCESS_KEY_ID_ENV));
        }
        let endpoint = non_empty(METADATA_ENDPOINT_ENV).unwrap_or_else(|| METADATA_ENDPOINT.to_string());
        Ok(Self::InstanceMetadata {
            endpoint: parse_url(&endpoint)?,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            CredentialSource::Static(_) => "environment",
            CredentialSource::Container { .. } => "container credentials endpoint",
            CredentialSource::InstanceMetadata { .. } => "instance metadata",
        }
    }
}

fn parse_url(url: &str) -> Result<Url, AwsError> {
    Url::parse(url).map_err(|_| AwsError::InvalidEndpoint(url.to_string()))
}

/// Body served by both the container credentials endpoint and the instance metadata service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialsResponse {
    code: Option<String>,
    message: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    token: Option<String>,
    expiration: Option<DateTime<Utc>>,
}

/// Hands out the current credentials of a [`CredentialSource`].
#[derive(Debug)]
pub struct CredentialsProvider {
    source: CredentialSource,
    http: reqwest::Client,
    cached: Mutex<Option<Credentials>>,
}

impl CredentialsProvider {
    pub fn new(source: CredentialSource) -> Result<Self, AwsError> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|error| AwsError::Transport {
                action: source.name().to_string(),
                error,
            })?;

        Ok(Self {
            source,
            http,
            cached: Mutex::new(None),
        })
    }

    pub fn from_env() -> Result<Self, AwsError> {
        Self::new(CredentialSource::from_env()?)
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    pub async fn credentials(&self) -> Result<Credentials, AwsError> {
        if let CredentialSource::Static(credentials) = &self.source {
            return Ok(credentials.clone());
        }

        let mut cached = self.cached.lock().await;
        if let Some(credentials) = cached.as_ref().filter(|c| !c.needs_refresh(Utc::now())) {
            return Ok(credentials.clone());
        }

        let credentials = self.fetch().await?;
        debug!(
            provider = self.source.name(),
            expires_at = ?credentials.expires_at(),
            "Loaded AWS credentials"
        );
        *cached = Some(credentials.clone());
        Ok(credentials)
    }

    async fn fetch(&self) -> Result<Credentials, AwsError> {
        match &self.source {
            CredentialSource::Static(credentials) => Ok(credentials.clone()),
            CredentialSource::Container { uri, authorization } => {
                let mut request = self.http.get(uri.clone());
                if let Some(authorization) = authorization {
                    request = request.header(AUTHORIZATION, authorization);
                }
                let body = self.send(request).await?;
                self.decode(&body)
            }
            CredentialSource::InstanceMetadata { endpoint } => self.fetch_instance_metadata(endpoint).await,
        }
    }

    async fn fetch_instance_metadata(&self, endpoint: &Url) -> Result<Credentials, AwsError> {
        let token_request = self
            .http
            .put(join(endpoint, METADATA_TOKEN_PATH)?)
            .header(METADATA_TOKEN_TTL_HEADER, METADATA_TOKEN_TTL_SECONDS);
        let token = match self.send(token_request).await {
            Ok(token) => Some(token.trim().to_string()),
            Err(err @ AwsError::CredentialsUnavailable { .. }) => {
                warn!("No IMDSv2 session token, falling back to IMDSv1: {err}");
                None
            }
            Err(err) => return Err(err),
        };
        let with_token = |request: RequestBuilder| match &token {
            Some(token) => request.header(METADATA_TOKEN_HEADER, token),
            None => request,
        };

        let roles = self
            .send(with_token(self.http.get(join(endpoint, METADATA_ROLES_PATH)?)))
            .await?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| AwsError::CredentialsUnavailable {
                provider: self.source.name(),
                message: "no IAM role is attached to the instance".to_string(),
            })?;

        let body = self
            .send(with_token(
                self.http.get(join(endpoint, &format!("{METADATA_ROLES_PATH}{role}"))?),
            ))
            .await?;
        self.decode(&body)
    }

    async fn send(&self, request: RequestBuilder) -> Result<String, AwsError> {
        let transport = |error| AwsError::Transport {
            action: self.source.name().to_string(),
            error,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(AwsError::CredentialsUnavailable {
                provider: self.source.name(),
                message: format!("{status}: {}", body.trim()),
            });
        }
        Ok(body)
    }

    fn decode(&self, body: &str) -> Result<Credentials, AwsError> {
        let provider = self.source.name();
        let response: CredentialsResponse = serde_json::from_str(body).map_err(|error| AwsError::Decode {
            action: provider.to_string(),
            error,
        })?;

        if let Some(code) = response.code.filter(|code| code != "Success") {
            return Err(AwsError::CredentialsUnavailable {
                provider,
                message: format!("{code}: {}", response.message.unwrap_or_default()),
            });
        }
        let missing = |field: &str| AwsError::CredentialsUnavailable {
            provider,
            message: format!("response has no {field}"),
        };
        let access_key_id = response.access_key_id.ok_or_else(|| missing("AccessKeyId"))?;
        let secret_access_key = response.secret_access_key.ok_or_else(|| missing("SecretAccessKey"))?;

        Ok(Credentials::new(access_key_id, secret_access_key, response.token).with_expiry(response.expiration))
    }
}

fn join(endpoint: &Url, path: &str) -> Result<Url, AwsError> {
    endpoint
        .join(path)
        .map_err(|_| AwsError::InvalidEndpoint(format!("{endpoint}{path}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{
            HeaderMap,
            StatusCode,
        },
        routing::{
            get,
            put,
        },
        Router,
    };
    use chrono::SecondsFormat;
    use pretty_assertions::assert_eq;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{
                AtomicUsize,
                Ordering,
            },
            Arc,
        },
    };
    use tokio::net::TcpListener;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| vars.get(name).cloned()
    }

    async fn serve(app: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        Url::parse(&format!("http://{address}")).unwrap()
    }

    fn credentials_body(expires_in: TimeDelta) -> String {
        serde_json::json!({
            "Code": "Success",
            "Type": "AWS-HMAC",
            "AccessKeyId": "ASIAEXAMPLE",
            "SecretAccessKey": "role-secret",
            "Token": "role-token",
            "Expiration": (Utc::now() + expires_in).to_rfc3339_opts(SecondsFormat::Secs, true),
        })
        .to_string()
    }

    /// A container credentials endpoint that counts its requests.
    async fn container_endpoint(expires_in: TimeDelta) -> (Url, Arc<AtomicUsize>) {
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let app = Router::new().route(
            "/v2/credentials/task-role",
            get(move |headers: HeaderMap| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                match headers.get("authorization").and_then(|value| value.to_str().ok()) {
                    Some("Bearer task-secret") => Ok(credentials_body(expires_in)),
                    _ => Err(StatusCode::UNAUTHORIZED),
                }
            }),
        );
        let base = serve(app).await;
        (base.join("/v2/credentials/task-role").unwrap(), requests)
    }

    #[test]
    fn environment_keys_come_first() {
        let source = CredentialSource::from_lookup(lookup(&[
            (ACCESS_KEY_ID_ENV, "AKIDEXAMPLE"),
            (SECRET_ACCESS_KEY_ENV, "secret"),
            (SESSION_TOKEN_ENV, ""),
            (CONTAINER_RELATIVE_URI_ENV, "/v2/credentials/task-role"),
        ]))
        .unwrap();
        let CredentialSource::Static(credentials) = &source else {
            panic!("expected static credentials, got {source:?}");
        };
        assert_eq!(credentials.access_key_id(), "AKIDEXAMPLE");
        assert_eq!(credentials.secret_access_key(), "secret");
        assert_eq!(credentials.session_token(), None);
        assert!(!format!("{credentials:?}").contains("\"secret\""));
    }

    #[test]
    fn access_key_without_secret() {
        let err = CredentialSource::from_lookup(lookup(&[(ACCESS_KEY_ID_ENV, "AKIDEXAMPLE")])).unwrap_err();
        assert!(matches!(err, AwsError::MissingCredentials(SECRET_ACCESS_KEY_ENV)));
    }

    #[test]
    fn task_role_endpoint() {
        let source = CredentialSource::from_lookup(lookup(&[
            (CONTAINER_RELATIVE_URI_ENV, "/v2/credentials/task-role"),
            (CONTAINER_FULL_URI_ENV, "http://localhost:8080/ignored"),
        ]))
        .unwrap();
        let CredentialSource::Container { uri, authorization } = &source else {
            panic!("expected the container endpoint, got {source:?}");
        };
        assert_eq!(uri.as_str(), "http://169.254.170.2/v2/credentials/task-role");
        assert_eq!(authorization.as_deref(), None);

        let source = CredentialSource::from_lookup(lookup(&[
            (CONTAINER_FULL_URI_ENV, "http://localhost:8080/creds"),
            (CONTAINER_AUTHORIZATION_ENV, "Bearer token"),
        ]))
        .unwrap();
        let CredentialSource::Container { uri, authorization } = &source else {
            panic!("expected the container endpoint, got {source:?}");
        };
        assert_eq!(uri.as_str(), "http://localhost:8080/creds");
        assert_eq!(authorization.as_deref(), Some("Bearer token"));
    }

    #[test]
    fn instance_metadata_is_the_fallback() {
        let source = CredentialSource::from_lookup(lookup(&[])).unwrap();
        let CredentialSource::InstanceMetadata { endpoint } = &source else {
            panic!("expected instance metadata, got {source:?}");
        };
        assert_eq!(endpoint.as_str(), "http://169.254.169.254/");

        let err = CredentialSource::from_lookup(lookup(&[(METADATA_DISABLED_ENV, "TRUE")])).unwrap_err();
        assert!(matches!(err, AwsError::MissingCredentials(ACCESS_KEY_ID_ENV)));
    }

    #[tokio::test]
    async fn container_credentials_are_cached() {
        let (uri, requests) = container_endpoint(TimeDelta::hours(1)).await;
        let provider = CredentialsProvider::new(CredentialSource::Container {
            uri,
            authorization: Some("Bearer task-secret".to_string()),
        })
        .unwrap();

        let credentials = provider.credentials().await.unwrap();
        assert_eq!(credentials.access_key_id(), "ASIAEXAMPLE");
        assert_eq!(credentials.secret_access_key(), "role-secret");
        assert_eq!(credentials.session_token(), Some("role-token"));
        assert!(credentials.expires_at().is_some());

        provider.credentials().await.unwrap();
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expiring_credentials_are_fetched_again() {
        let (uri, requests) = container_endpoint(TimeDelta::minutes(1)).await;
        let provider = CredentialsProvider::new(CredentialSource::Container {
            uri,
            authorization: Some("Bearer task-secret".to_string()),
        })
        .unwrap();

        provider.credentials().await.unwrap();
        provider.credentials().await.unwrap();
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_container_request() {
        let (uri, _) = container_endpoint(TimeDelta::hours(1)).await;
        let provider = CredentialsProvider::new(CredentialSource::Container {
            uri,
            authorization: None,
        })
        .unwrap();

        let err = provider.credentials().await.unwrap_err();
        assert!(
            matches!(err, AwsError::CredentialsUnavailable { message, .. } if message.starts_with("401")),
        );
    }

    #[tokio::test]
    async fn instance_profile_with_session_token() {
        let app = Router::new()
            .route(
                METADATA_TOKEN_PATH,
                put(|headers: HeaderMap| async move {
                    match headers.get(METADATA_TOKEN_TTL_HEADER) {
                        Some(_) => Ok("imds-token"),
                        None => Err(StatusCode::BAD_REQUEST),
                    }
                }),
            )
            .route(
                METADATA_ROLES_PATH,
                get(|headers: HeaderMap| async move {
                    match headers.get(METADATA_TOKEN_HEADER).and_then(|value| value.to_str().ok()) {
                        Some("imds-token") => Ok("exporter-role\n"),
                        _ => Err(StatusCode::UNAUTHORIZED),
                    }
                }),
            )
            .route(
                "/latest/meta-data/iam/security-credentials/exporter-role",
                get(|headers: HeaderMap| async move {
                    match headers.get(METADATA_TOKEN_HEADER).and_then(|value| value.to_str().ok()) {
                        Some("imds-token") => Ok(credentials_body(TimeDelta::hours(6))),
                        _ => Err(StatusCode::UNAUTHORIZED),
                    }
                }),
            );
        let endpoint = serve(app).await;
        let provider = CredentialsProvider::new(CredentialSource::InstanceMetadata { endpoint }).unwrap();

        let credentials = provider.credentials().await.unwrap();
        assert_eq!(credentials.access_key_id(), "ASIAEXAMPLE");
        assert_eq!(credentials.session_token(), Some("role-token"));
    }

    #[tokio::test]
    async fn instance_without_role() {
        let app = Router::new()
            .route(METADATA_TOKEN_PATH, put(|| async { "imds-token" }))
            .route(METADATA_ROLES_PATH, get(|| async { "" }));
        let endpoint = serve(app).await;
        let provider = CredentialsProvider::new(CredentialSource::InstanceMetadata { endpoint }).unwrap();

        let err = provider.credentials().await.unwrap_err();
        assert!(matches!(err, AwsError::CredentialsUnavailable { .. }), "{err}");
    }

    #[test]
    fn failed_metadata_code() {
        let provider = CredentialsProvider::new(CredentialSource::InstanceMetadata {
            endpoint: Url::parse(METADATA_ENDPOINT).unwrap(),
        })
        .unwrap();
        let err = provider
            .decode(r#"{"Code":"AssumeRoleUnauthorizedAccess","Message":"denied"}"#)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "could not load credentials from instance metadata: AssumeRoleUnauthorizedAccess: denied"
        );
    }
}
