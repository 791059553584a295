//! Error types of the HTTP runtime.

use std::{error::Error, fmt, sync::Arc};

pub mod client;
pub mod server;

pub use self::{client::ClientError, server::ServerError};

/// A boxed, type-erased error.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// A cheaply clonable error, used where one failure must be delivered to
/// several waiters (e.g. a failed pending acquisition in the pool).
#[derive(Debug, Clone)]
pub struct SharedError(Arc<dyn Error + Send + Sync>);

impl SharedError {
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    pub fn from_boxed(error: BoxError) -> Self {
        Self(Arc::from(error))
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Error for SharedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}
