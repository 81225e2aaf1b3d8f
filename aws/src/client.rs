use crate::{
    credentials::{
        Credentials,
        CredentialsProvider,
    },
    error::AwsError,
    signing::{
        self,
        SigningRequest,
        SigningScope,
    },
};
use chrono::Utc;
use reqwest::header::{
    HeaderMap,
    HeaderName,
    HeaderValue,
    AUTHORIZATION,
    CONTENT_TYPE,
};
use serde::{
    de::DeserializeOwned,
    Serialize,
};
use std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Version of an AWS JSON protocol, selecting the request content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonVersion {
    V1_0,
    V1_1,
}

impl JsonVersion {
    pub fn content_type(&self) -> &'static str {
        match self {
            JsonVersion::V1_0 => "application/x-amz-json-1.0",
            JsonVersion::V1_1 => "application/x-amz-json-1.1",
        }
    }
}

/// Which AWS service a client talks to.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSpec {
    /// Endpoint prefix and signing name.
    pub name: &'static str,
    pub target_prefix: &'static str,
    pub version: JsonVersion,
}

/// Signed JSON-over-HTTP client for a single AWS service in a single region.
#[derive(Debug, Clone)]
pub struct AwsJsonClient {
    http: reqwest::Client,
    service: ServiceSpec,
    region: String,
    endpoint: Url,
    credentials: Arc<CredentialsProvider>,
}

impl AwsJsonClient {
    pub fn new(
        service: ServiceSpec,
        region: impl Into<String>,
        endpoint: Option<Url>,
        credentials: Arc<CredentialsProvider>,
    ) -> Result<Self, AwsError> {
        let region = region.into();
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => {
                let endpoint = format!("https://{}.{region}.amazonaws.com/", service.name);
                Url::parse(&endpoint).map_err(|_| AwsError::InvalidEndpoint(endpoint))?
            }
        };
        if endpoint.host_str().is_none() {
            return Err(AwsError::InvalidEndpoint(endpoint.to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| AwsError::Transport {
                action: "client setup".to_string(),
                error,
            })?;

        Ok(Self {
            http,
            service,
            region,
            endpoint,
            credentials,
        })
    }

    /// `host[:port]` as sent in the `Host` header.
    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    pub(crate) fn signed_headers(
        &self,
        action: &str,
        body: &[u8],
        credentials: &Credentials,
    ) -> Result<HeaderMap, AwsError> {
        let scope = SigningScope {
            region: &self.region,
            service: self.service.name,
            time: Utc::now(),
        };

        let mut headers = vec![
            (CONTENT_TYPE.to_string(), self.service.version.content_type().to_string()),
            ("host".to_string(), self.host()),
            ("x-amz-date".to_string(), scope.amz_date()),
            (
                "x-amz-target".to_string(),
                format!("{}.{action}", self.service.target_prefix),
            ),
        ];
        if let Some(token) = credentials.session_token() {
            headers.push(("x-amz-security-token".to_string(), token.to_string()));
        }

        let authorization = signing::authorization(
            credentials,
            &scope,
            &SigningRequest {
                method: "POST",
                path: self.endpoint.path(),
                query: "",
                headers: headers.clone(),
                payload: body,
            },
        );
        headers.push((AUTHORIZATION.to_string(), authorization));

        let mut map = HeaderMap::new();
        for (name, value) in headers {
            // reqwest derives Host from the URL
            if name == "host" {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AwsError::InvalidEndpoint(format!("invalid header name {name}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| AwsError::InvalidEndpoint(format!("invalid value for header {name}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    /// Sends one `action` request and decodes its response.
    pub async fn call<Req, Resp>(&self, action: &str, request: &Req) -> Result<Resp, AwsError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request).map_err(|error| AwsError::Decode {
            action: action.to_string(),
            error,
        })?;
        let credentials = self.credentials.credentials().await?;
        let headers = self.signed_headers(action, &body, &credentials)?;
        let transport = |error| AwsError::Transport {
            action: action.to_string(),
            error,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(self.endpoint.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport)?;
        trace!(
            service = self.service.name,
            action,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "AWS call finished"
        );

        if !status.is_success() {
            return Err(AwsError::from_response(action, status.as_u16(), &bytes));
        }

        // Some actions answer with an empty body
        let bytes = if bytes.is_empty() { &b"{}"[..] } else { &bytes[..] };
        serde_json::from_slice(bytes).map_err(|error| AwsError::Decode {
            action: action.to_string(),
            error,
        })
    }
}
