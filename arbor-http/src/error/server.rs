//! Server-side error taxonomy.
//!
//! `HttpStatus` and `HttpResponse` are control-flow values: handlers and
//! decorators return them to short-circuit with a specific status or a
//! literal response. Everything else maps to 500.

use faststr::FastStr;
use http::StatusCode;

use super::BoxError;
use crate::{body::Body, response::Response};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Short-circuit with the given status code.
    #[error("http status: {0}")]
    HttpStatus(StatusCode),

    /// Short-circuit with a literal response.
    #[error("http response short-circuit")]
    HttpResponse(Response),

    /// A malformed path, header or frame.
    #[error("protocol violation: {0}")]
    ProtocolViolation(FastStr),

    /// An unclassified handler failure; rendered as 500.
    #[error("internal handler error")]
    Internal(#[source] BoxError),
}

impl ServerError {
    pub fn status(status: StatusCode) -> Self {
        Self::HttpStatus(status)
    }

    pub fn internal<E>(source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Internal(source.into())
    }

    /// Renders this error as the response the peer observes.
    pub fn into_response(self) -> Response {
        match self {
            Self::HttpStatus(status) => status_response(status),
            Self::HttpResponse(resp) => resp,
            Self::ProtocolViolation(reason) => {
                tracing::debug!("rejecting malformed request: {reason}");
                status_response(StatusCode::BAD_REQUEST)
            }
            Self::Internal(err) => {
                tracing::warn!("handler failed: {err}");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

pub(crate) fn status_response(status: StatusCode) -> Response {
    let mut resp = http::Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod server_error_tests {
    use http::StatusCode;

    use super::ServerError;

    #[test]
    fn rendering() {
        let resp = ServerError::status(StatusCode::NOT_FOUND).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ServerError::internal(std::io::Error::other("boom")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let inner = super::status_response(StatusCode::IM_A_TEAPOT);
        let resp = ServerError::HttpResponse(inner).into_response();
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
    }
}
