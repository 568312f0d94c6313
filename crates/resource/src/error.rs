//! Resource Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A resource error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for resource operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Reading from or writing to a tier failed.
    #[display("storage operation on tier `{_0}` failed")]
    Storage(#[error(not(source))] String),
    /// The external creator could not convert a resource.
    #[display("conversion of `{_0}` failed")]
    Conversion(#[error(not(source))] String),
    /// The external loader could not turn bytes into an object.
    #[display("loading `{_0}` failed")]
    Load(#[error(not(source))] String),
    /// A configured tier root could not be used.
    #[display("invalid tier layout at {}", _0.display())]
    Layout(#[error(not(source))] PathBuf),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
