use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Write rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Unauthorized - check the configured API key")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            401 | 403 => RemoteError::Unauthorized,
            404 => RemoteError::NotFound(truncated),
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::ServerError(truncated),
            _ => RemoteError::Rejected {
                status,
                body: truncated,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(RemoteError::from_status(401, ""), RemoteError::Unauthorized));
        assert!(matches!(RemoteError::from_status(429, ""), RemoteError::RateLimited));
        assert!(matches!(RemoteError::from_status(503, "down"), RemoteError::ServerError(_)));
        assert!(matches!(
            RemoteError::from_status(409, "duplicate key"),
            RemoteError::Rejected { status: 409, .. }
        ));
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "é".repeat(400);
        let err = RemoteError::from_status(400, &body);
        let msg = err.to_string();
        assert!(msg.contains("truncated, 800 total bytes"));
    }
}
