use serde::Deserialize;

/// Failures talking to an AWS JSON protocol API.
#[derive(thiserror::Error, Debug)]
pub enum AwsError {
    #[error("{action} failed with {status}: {code}: {message}")]
    Api {
        action: String,
        code: String,
        message: String,
        status: u16,
    },
    #[error("request to {action} failed: {error}")]
    Transport { action: String, error: reqwest::Error },
    #[error("unexpected response to {action}: {error}")]
    Decode { action: String, error: serde_json::Error },
    #[error("missing AWS credentials, {0} is not set")]
    MissingCredentials(&'static str),
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("could not load credentials from {provider}: {message}")]
    CredentialsUnavailable { provider: &'static str, message: String },
}

/// Error body of the AWS JSON protocols.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

impl AwsError {
    /// Builds an `Api` error from a non-success response body.
    pub(crate) fn from_response(action: &str, status: u16, body: &[u8]) -> Self {
        let (code, message) = match serde_json::from_slice::<ErrorBody>(body) {
            Ok(ErrorBody { kind, message }) => {
                // `aws.protocoltests#ClientException` or a plain `ClientException`
                let code = kind.rsplit('#').next().unwrap_or_default().to_string();
                (code, message)
            }
            Err(_) => ("Unknown".to_string(), String::from_utf8_lossy(body).into_owned()),
        };
        AwsError::Api {
            action: action.to_string(),
            code,
            message,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(err: &AwsError) -> Option<&str> {
        match err {
            AwsError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    #[test]
    fn decodes_error_body() {
        let err = AwsError::from_response(
            "ListClusters",
            400,
            br#"{"__type":"com.amazonaws.ecs#ClientException","message":"Cluster not found."}"#,
        );
        assert_eq!(code(&err), Some("ClientException"));
        assert_eq!(
            err.to_string(),
            "ListClusters failed with 400: ClientException: Cluster not found."
        );
    }

    #[test]
    fn capitalized_message_and_plain_type() {
        let err = AwsError::from_response(
            "GetMetricStatistics",
            403,
            br#"{"__type":"AccessDeniedException","Message":"denied"}"#,
        );
        assert_eq!(code(&err), Some("AccessDeniedException"));
        assert!(err.to_string().ends_with("denied"));
    }

    #[test]
    fn non_json_body() {
        let err = AwsError::from_response("ListServices", 502, b"Bad Gateway");
        assert_eq!(code(&err), Some("Unknown"));
        assert!(err.to_string().contains("Bad Gateway"));
    }
}
