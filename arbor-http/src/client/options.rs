//! Per-connection request options.

use std::time::Duration;

use http::HeaderMap;

use crate::body::ContentPreviewerFactory;

/// The recognized connection options.
///
/// Set on a [`ClientBuilder`](super::ClientBuilder) as defaults; a request
/// may carry its own copy to override them.
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    /// Per-request write deadline: the request body must keep making
    /// progress within this window.
    pub write_timeout: Option<Duration>,
    /// End-to-end reply deadline, covering headers and the full body.
    pub response_timeout: Option<Duration>,
    /// Maximum response payload size; `0` means unlimited.
    pub max_response_length: u64,
    /// Extra headers sent with every request; existing request headers win.
    pub headers: HeaderMap,
    /// Opaque logging hook over request body frames.
    pub req_content_previewer: Option<ContentPreviewerFactory>,
    /// Opaque logging hook over response body frames.
    pub res_content_previewer: Option<ContentPreviewerFactory>,
}

impl ConnectionOptions {
    /// The defaults used by a freshly built client.
    pub fn standard() -> Self {
        Self {
            write_timeout: Some(Duration::from_secs(1)),
            response_timeout: Some(Duration::from_secs(15)),
            max_response_length: 10 * 1024 * 1024,
            headers: HeaderMap::new(),
            req_content_previewer: None,
            res_content_previewer: None,
        }
    }
}
