//! SQLite client: connection lifecycle, pluggable object encoding, and
//! optional envelope encryption.

#![forbid(unsafe_code)]

mod connection;
mod encoding;
mod encryption;
mod error;

pub use connection::Connection;
pub use encoding::{Codec, Encoder, Encoding};
pub use encryption::{decrypt, encrypt, KeyRegistry};
pub use error::{QueryError, SqlResult};
