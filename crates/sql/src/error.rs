//! `QueryError` preserves the originating SQL for diagnostics.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
#[error("query error: {query}: {cause}")]
pub struct QueryError {
    pub query: String,
    pub cause: String,
}

impl QueryError {
    pub fn new(query: impl Into<String>, cause: impl Into<String>) -> Self {
        Self { query: query.into(), cause: cause.into() }
    }
}

pub type SqlResult<T> = Result<T, QueryError>;
