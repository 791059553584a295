//! Client-side error taxonomy.
//!
//! Every wire-facing failure a caller can observe maps onto one of these
//! kinds. [`ClientError::is_retry_safe`] answers the only question callers
//! usually have: is it safe to re-issue the request verbatim?

use faststr::FastStr;

use super::BoxError;
use crate::proto::SessionProtocol;

/// [`Result`](std::result::Result) with [`ClientError`] as its error by default.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Client-side error kinds.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request never reached the wire: a connection could not be
    /// obtained or negotiated. Always safe to retry.
    #[error("request was not processed")]
    UnprocessedRequest {
        #[source]
        source: BoxError,
    },

    /// The channel closed while the request was in flight.
    #[error("session was closed while the request was in flight")]
    ClosedSession,

    /// ALPN/upgrade produced a different protocol than requested.
    #[error("protocol negotiation failed: expected {expected}, actual {actual:?}: {reason}")]
    ProtocolNegotiation {
        expected: SessionProtocol,
        actual: Option<SessionProtocol>,
        reason: FastStr,
    },

    /// No complete response within the response timeout.
    #[error("response timed out")]
    ResponseTimeout,

    /// The request body was not drained within the write timeout.
    #[error("request write timed out")]
    WriteTimeout,

    /// The server's SETTINGS forbid opening a new stream.
    #[error("stream refused by the remote peer")]
    RefusedStream,

    /// The response payload exceeded the configured maximum length.
    #[error("response content exceeds the maximum allowed length")]
    ContentTooLarge,

    /// The response consumer cancelled its subscription before completion.
    #[error("response consumer cancelled before completion")]
    ClosedPublisher,

    /// A malformed path, header, scheme or frame.
    #[error("protocol violation: {0}")]
    ProtocolViolation(FastStr),
}

impl ClientError {
    /// Wraps `source` as an [`UnprocessedRequest`](Self::UnprocessedRequest),
    /// the marker that the request never reached the wire.
    pub fn unprocessed<E>(source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::UnprocessedRequest {
            source: source.into(),
        }
    }

    pub fn violation(reason: impl Into<FastStr>) -> Self {
        Self::ProtocolViolation(reason.into())
    }

    /// Whether re-issuing the request verbatim is safe.
    ///
    /// Protocol-negotiation mismatches are retryable only under a protocol
    /// fallback policy and timeouts only under an idempotency policy, so
    /// both report false here.
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            Self::UnprocessedRequest { .. } | Self::ClosedSession | Self::RefusedStream,
        )
    }
}

#[cfg(test)]
mod client_error_tests {
    use std::error::Error;

    use super::ClientError;
    use crate::proto::SessionProtocol;

    #[test]
    fn retry_safety() {
        assert!(ClientError::unprocessed(ClientError::ClosedSession).is_retry_safe());
        assert!(ClientError::ClosedSession.is_retry_safe());
        assert!(ClientError::RefusedStream.is_retry_safe());

        assert!(!ClientError::ResponseTimeout.is_retry_safe());
        assert!(!ClientError::WriteTimeout.is_retry_safe());
        assert!(!ClientError::ContentTooLarge.is_retry_safe());
        assert!(
            !ClientError::ProtocolNegotiation {
                expected: SessionProtocol::H2,
                actual: Some(SessionProtocol::H1),
                reason: "alpn mismatch".into(),
            }
            .is_retry_safe()
        );
    }

    #[test]
    fn unprocessed_preserves_the_cause() {
        let err = ClientError::unprocessed(ClientError::RefusedStream);
        let source = err.source().unwrap();
        assert!(matches!(
            source.downcast_ref::<ClientError>(),
            Some(ClientError::RefusedStream),
        ));
    }
}
