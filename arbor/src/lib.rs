//! Transport-agnostic building blocks of the arbor runtime.
//!
//! This crate carries the pieces that do not depend on any particular wire
//! protocol: the [`Endpoint`] model, endpoint groups with change
//! notification, active health checking, and the per-endpoint event-loop
//! scheduler. The HTTP client and server live in `arbor-http`.

pub mod discovery;
pub mod endpoint;
pub mod healthcheck;
pub mod scheduler;

pub use faststr::FastStr;

pub use self::{
    discovery::{EndpointChange, EndpointGroup},
    endpoint::Endpoint,
    scheduler::EventLoopScheduler,
};
