//! Errors surfaced to renters.

use http::StatusCode;

use crate::body::{Body, Response};
use crate::registry::SessionId;

/// Why a forwarded request did not produce a provider response.
///
/// Each pending request resolves with at most one of these, exactly once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TunnelError {
    /// No provider is connected for the session.
    #[error("no provider connected for session {0}")]
    ProviderUnavailable(SessionId),

    /// The provider's connection closed while the request was in flight.
    #[error("provider disconnected")]
    ProviderDisconnected,

    /// A new provider connection superseded the one carrying the request.
    #[error("provider connection replaced")]
    ProviderReplaced,

    /// The provider did not respond within the deadline.
    #[error("timed out waiting for provider")]
    Timeout,

    /// The provider reported a failure.
    #[error("provider error: {0}")]
    Provider(String),

    /// The request was abandoned before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// A request frame does not fit in a single message on the provider channel.
    #[error("request frame of {size} bytes exceeds the limit of {limit} bytes")]
    RequestTooLarge {
        /// Encoded size of the offending frame.
        size: usize,
        /// Largest message the channel carries.
        limit: usize,
    },
}

impl TunnelError {
    /// HTTP status reported to the renter.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TunnelError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TunnelError::ProviderDisconnected
            | TunnelError::ProviderReplaced
            | TunnelError::Provider(_) => StatusCode::BAD_GATEWAY,
            TunnelError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            TunnelError::Cancelled => StatusCode::BAD_REQUEST,
            TunnelError::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Render the error as a plain text response.
    pub fn into_response(self) -> Response {
        let mut response = http::Response::new(Body::from(self.to_string()));
        *response.status_mut() = self.status_code();
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::BodyExt as _;

    #[test]
    fn statuses() {
        assert_eq!(
            TunnelError::ProviderUnavailable("s2".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TunnelError::ProviderDisconnected.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TunnelError::ProviderReplaced.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(TunnelError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            TunnelError::RequestTooLarge {
                size: 8192,
                limit: 4096
            }
            .status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn response_carries_message() {
        let response = TunnelError::ProviderUnavailable("s2".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&*body, b"no provider connected for session s2");
    }
}
