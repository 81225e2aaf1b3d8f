//! AWS Signature Version 4 for the JSON protocol requests this crate sends.

use crate::credentials::Credentials;
use chrono::{
    DateTime,
    Utc,
};
use hmac::{
    digest::KeyInit,
    Hmac,
    Mac,
};
use sha2::{
    Digest,
    Sha256,
};

pub const SIGN_V4_ALGORITHM: &str = "AWS4-HMAC-SHA256";

const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const SCOPE_DATE_FORMAT: &str = "%Y%m%d";

/// The parts of an HTTP request that go into its signature.
#[derive(Debug, Clone)]
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Already canonical: sorted by key and URI encoded.
    pub query: &'a str,
    /// Headers to sign, names in any case.
    pub headers: Vec<(String, String)>,
    pub payload: &'a [u8],
}

/// Where and when a request is signed.
#[derive(Debug, Clone, Copy)]
pub struct SigningScope<'a> {
    pub region: &'a str,
    pub service: &'a str,
    pub time: DateTime<Utc>,
}

impl SigningScope<'_> {
    pub fn amz_date(&self) -> String {
        self.time.format(AMZ_DATE_FORMAT).to_string()
    }

    fn credential_scope(&self) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            self.time.format(SCOPE_DATE_FORMAT),
            self.region,
            self.service
        )
    }
}

pub fn hmac_sha256(key: impl AsRef<[u8]>, data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(key.as_ref()).expect("HMAC takes keys of any size");
    mac.update(data.as_ref());
    mac.finalize().into_bytes().into()
}

pub fn hex_sha256(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

pub fn signing_key(secret: &str, scope: &SigningScope<'_>) -> [u8; 32] {
    let date = hmac_sha256(format!("AWS4{secret}"), scope.time.format(SCOPE_DATE_FORMAT).to_string());
    let region = hmac_sha256(date, scope.region);
    let service = hmac_sha256(region, scope.service);
    hmac_sha256(service, "aws4_request")
}

fn canonical_headers(headers: &[(String, String)]) -> (String, String) {
    let mut headers = headers
        .iter()
        .map(|(name, value)| (name.trim().to_lowercase(), value.split_whitespace().collect::<Vec<_>>().join(" ")))
        .collect::<Vec<_>>();
    headers.sort();

    let canonical = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect::<String>();
    let signed = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    (canonical, signed)
}

pub fn canonical_request(request: &SigningRequest<'_>) -> (String, String) {
    let (headers, signed_headers) = canonical_headers(&request.headers);
    let canonical = [
        request.method.to_string(),
        request.path.to_string(),
        request.query.to_string(),
        headers,
        signed_headers.clone(),
        hex_sha256(request.payload),
    ]
    .join("\n");
    (canonical, signed_headers)
}

pub fn string_to_sign(scope: &SigningScope<'_>, canonical_request: &str) -> String {
    [
        SIGN_V4_ALGORITHM.to_string(),
        scope.amz_date(),
        scope.credential_scope(),
        hex_sha256(canonical_request),
    ]
    .join("\n")
}

/// Computes the `Authorization` header value for `request`.
pub fn authorization(credentials: &Credentials, scope: &SigningScope<'_>, request: &SigningRequest<'_>) -> String {
    let (canonical, signed_headers) = canonical_request(request);
    let signature = hex::encode(hmac_sha256(
        signing_key(credentials.secret_access_key(), scope),
        string_to_sign(scope, &canonical),
    ));
    trace!(%canonical, "Signed request");

    format!(
        "{SIGN_V4_ALGORITHM} Credential={}/{}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id(),
        scope.credential_scope(),
    )
}
