use ter_core::error::ErrorKind;
use thiserror::Error;

/// A probe failure, already worded for display. `Clone` so one failure can be
/// handed to every caller sharing an in-flight fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("{0}")]
    Unreachable(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    ToolMissing(String),
    #[error("{0}")]
    Protocol(String),
    /// No credential is configured at all.
    #[error("{0}")]
    NotConnected(String),
    /// The tool answered but refuses to work until it is upgraded.
    #[error("{0}")]
    UpdateRequired(String),
    #[error("{provider} http {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{0}")]
    Failed(String),
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::Unreachable(_) => ErrorKind::Unreachable,
            ProbeError::Timeout(_) => ErrorKind::Timeout,
            ProbeError::Unauthorized(_) => ErrorKind::Unauthorized,
            ProbeError::NotFound(_) => ErrorKind::NotFound,
            ProbeError::ToolMissing(_) => ErrorKind::ToolMissing,
            ProbeError::Protocol(_) => ErrorKind::Protocol,
            ProbeError::NotConnected(_) => ErrorKind::NotConnected,
            ProbeError::UpdateRequired(_) | ProbeError::Failed(_) => ErrorKind::Failed,
            ProbeError::Http { status: 404, .. } => ErrorKind::NotFound,
            ProbeError::Http { .. } => ErrorKind::Failed,
        }
    }
}

/// Keeps at most `max` characters of a response body.
pub fn truncate_body(body: &str, max: usize) -> String {
    body.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_formats_like_other_provider_errors() {
        let err = ProbeError::Http {
            provider: "copilot".to_string(),
            status: 500,
            body: truncate_body(&"x".repeat(300), 200),
        };
        let text = err.to_string();
        assert!(text.starts_with("copilot http 500: "));
        assert_eq!(text.len(), "copilot http 500: ".len() + 200);
        assert_eq!(err.kind(), ErrorKind::Failed);
    }

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(
            ProbeError::NotConnected("copilot token missing".into()).kind(),
            ErrorKind::NotConnected
        );
        assert_eq!(
            ProbeError::Http {
                provider: "cursor".into(),
                status: 404,
                body: String::new()
            }
            .kind(),
            ErrorKind::NotFound
        );
    }
}
