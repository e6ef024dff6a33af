//! Error taxonomy for the basalt engine.
//!
//! Logical failures are returned as [`BasaltError`] values. I/O failures on
//! the database, log, or xid files discovered *after* open, and internal
//! invariant violations, are fatal: a single-process engine whose backing
//! files stop responding mid-flight has no safe way to continue, so those
//! sites panic instead of threading an error nobody can handle. Open and
//! create paths do return [`BasaltError::Io`] so callers can report a
//! missing or unreadable file.

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BasaltError>;

#[derive(Debug, Error)]
pub enum BasaltError {
    /// No page with enough free space could be found or created within the
    /// insert retry budget. Transient; the caller may retry.
    #[error("database is busy")]
    Busy,

    /// The framed data item would not fit in a page.
    #[error("data of {len} bytes exceeds the page payload capacity")]
    DataTooLarge { len: usize },

    /// The refcount cache is at capacity and the key is not resident.
    #[error("cache is full")]
    CacheFull,

    /// The log file failed its open-time structure check.
    #[error("bad log file")]
    BadLogFile,

    /// The xid file size disagrees with its header.
    #[error("bad xid file")]
    BadXidFile,

    /// The addressed data item was invalidated by recovery; the record it
    /// held never committed. Presented to callers as "not found".
    #[error("nil entry")]
    NilEntry,

    /// Deadlock or version skip: the schedule cannot be serialized. The
    /// transaction has been auto-aborted and keeps reporting this error
    /// until the client aborts it.
    #[error("could not serialize access due to concurrent update")]
    CannotSerialize,

    /// I/O failure while opening or creating one of the engine files.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl BasaltError {
    /// Whether the error is the sticky serialization failure.
    #[must_use]
    pub const fn is_cannot_serialize(&self) -> bool {
        matches!(self, Self::CannotSerialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(BasaltError::Busy.to_string(), "database is busy");
        assert_eq!(
            BasaltError::DataTooLarge { len: 9000 }.to_string(),
            "data of 9000 bytes exceeds the page payload capacity"
        );
        assert!(BasaltError::CannotSerialize.is_cannot_serialize());
        assert!(!BasaltError::Busy.is_cannot_serialize());
    }

    #[test]
    fn test_io_conversion() {
        let err: BasaltError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, BasaltError::Io(_)));
    }
}
