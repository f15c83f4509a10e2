use reqwest::StatusCode;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{context}: {status} - {body}")]
    Status {
        context: &'static str,
        status: StatusCode,
        body: String,
    },

    /// The backend rejected the token and refreshing it did not help.
    #[error("not authorized; log in again or pass --token")]
    Unauthorized,

    #[error("no auth token found; pass --token, set NEWSDIGEST_TOKEN, or run `newsdigest login`")]
    MissingToken,

    #[error("token file error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl ClientError {
    pub(crate) async fn from_response(context: &'static str, response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ClientError::Status {
            context,
            status,
            body,
        }
    }
}

/// Terminal failure of an open chat stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stream read error: {0}")]
pub struct StreamError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_mentions_context_and_body() {
        let err = ClientError::Status {
            context: "Failed to open stream",
            status: StatusCode::BAD_GATEWAY,
            body: "upstream down".to_string(),
        };
        let text = err.to_string();
        assert!(text.starts_with("Failed to open stream"), "{text}");
        assert!(text.contains("502"), "{text}");
        assert!(text.contains("upstream down"), "{text}");
    }
}
