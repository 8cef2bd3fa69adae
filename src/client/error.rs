use thiserror::Error;

/// Errors seen by code issuing API calls through the coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The server rejected the access credential, even after one refresh.
    #[error("Unauthorized")]
    Unauthorized,

    /// Refreshing failed; the local session is gone and the user must sign in again.
    #[error("Session expired - sign in again")]
    SessionExpired,

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ClientError {
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => ClientError::Unauthorized,
            code => ClientError::Server {
                status: code,
                body: Self::truncate_body(body),
            },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else if e.is_decode() {
            ClientError::InvalidResponse(e.to_string())
        } else {
            ClientError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn only_401_counts_as_unauthorized() {
        assert_eq!(
            ClientError::from_status(StatusCode::UNAUTHORIZED, ""),
            ClientError::Unauthorized
        );
        assert!(matches!(
            ClientError::from_status(StatusCode::FORBIDDEN, "nope"),
            ClientError::Server { status: 403, .. }
        ));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "é".repeat(400);
        match ClientError::from_status(StatusCode::BAD_GATEWAY, &body) {
            ClientError::Server { body: b, .. } => assert!(b.contains("truncated, 800 total bytes")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
