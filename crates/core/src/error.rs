//! Outward error kinds. Inward errors (`QueryError`,
//! `SlowReader`, `BufferClosed`, `CacheNotSynced`, `SchemaGone`) live next to
//! the component that raises them and convert into one of these at the
//! boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SteveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SteveError {
    /// The HTTP status an external router would map this to. Steve itself
    /// doesn't run the router, but every other crate in the workspace needs
    /// a stable number to log and to put on the wire in the WebSocket
    /// `resource.stop` / error envelopes.
    pub fn status_code(&self) -> u16 {
        match self {
            SteveError::NotFound(_) => 404,
            SteveError::Forbidden(_) => 403,
            SteveError::InvalidQuery(_) => 400,
            SteveError::Conflict(_) => 409,
            SteveError::Unavailable(_) => 503,
            SteveError::Internal(_) => 500,
        }
    }
}

pub type SteveResult<T> = Result<T, SteveError>;
