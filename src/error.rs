use reqwest::StatusCode;
use thiserror::Error;

/// 上游平台查询失败
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {operation}")]
    Status {
        status: StatusCode,
        operation: &'static str,
    },

    #[error("api error: {0}")]
    Api(String),

    #[error("playlist error: {0}")]
    Playlist(String),

    #[error("channel {0} is offline")]
    Offline(String),

    #[error("missing platform credentials")]
    MissingCredentials,
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
            }
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Api(_) | Self::Playlist(_) | Self::Offline(_) | Self::MissingCredentials => {
                false
            }
        }
    }
}

/// 启动转码进程失败。所有变体都会保留目标以便后续重试
#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to resolve source: {0}")]
    Resolution(#[from] ResolveError),

    #[error("no usable quality for channel {0}")]
    NoUsableQuality(String),

    #[error("insufficient system memory ({0} KB available)")]
    InsufficientMemory(u64),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_retryability() {
        let retry = ResolveError::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            operation: "gql",
        };
        let server = ResolveError::Status {
            status: StatusCode::BAD_GATEWAY,
            operation: "usher",
        };
        let client = ResolveError::Status {
            status: StatusCode::UNAUTHORIZED,
            operation: "helix",
        };
        assert!(retry.is_retryable());
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!ResolveError::Offline("alpha".into()).is_retryable());
    }
}
