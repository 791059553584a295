//! Asynchronous HTTP/1.1 and HTTP/2 client/server runtime.
//!
//! The client side pools and multiplexes connections per
//! (protocol, host, ip, port), negotiates the session protocol, and runs
//! every request through a composable decorator chain with write/response
//! timeouts and content-length limits. The server side routes requests
//! through a trie/regex router with content negotiation onto decorated
//! handlers under a reschedulable request timeout.
//!
//! Endpoint membership (groups, health checking, worker affinity) lives in
//! the [`arbor`] crate; this crate binds it to HTTP.

pub mod body;
pub mod client;
pub mod error;
pub mod healthcheck;
pub mod proto;
pub mod request;
pub mod response;
pub mod server;

pub use self::{
    body::Body,
    client::{ClientBuilder, ClientFactory, HttpClient},
    error::{ClientError, ServerError},
    proto::SessionProtocol,
    request::Request,
    response::Response,
    server::{Server, ServerBuilder},
};
