//! # Error Handling
//!
//! A single error enum covers every failure mode in the engine. Each
//! variant maps onto the CouchDB HTTP status it would be reported with:
//!
//! | Status | Variants |
//! |--------|----------|
//! | 400    | [`Error::BadRequest`], [`Error::BadRev`] |
//! | 404    | [`Error::NotFound`] |
//! | 409    | [`Error::Conflict`] |
//! | 412    | [`Error::PreconditionFailed`] |
//! | 500    | [`Error::Sqlite`], [`Error::Json`], [`Error::Cancelled`], [`Error::Internal`] |
//!
//! Validation errors are surfaced unwrapped. Storage errors are wrapped
//! with a 500 status unless they represent a known constraint violation,
//! which the write engine interprets as "revision already known" and
//! suppresses.

use thiserror::Error;

/// All errors that can occur in database operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request: invalid database/document id, id/`_id` mismatch,
    /// rev/option disagreement, invalid attachment data, invalid JSON body.
    #[error("{0}")]
    BadRequest(String),

    /// A revision string that does not parse as `"<N>-<hex>"`.
    #[error("invalid rev format")]
    BadRev,

    /// Missing database, document, or revision body.
    #[error("{0}")]
    NotFound(String),

    /// Winner mismatch, wrong history with `_revisions`, or a new-document
    /// write that supplied a revision. The message is usually just
    /// `"conflict"`, matching CouchDB; the `_revisions`-vs-option-rev case
    /// carries its own message.
    #[error("{0}")]
    Conflict(String),

    /// `CreateDB` against a database that already exists.
    #[error("database already exists")]
    PreconditionFailed,

    /// The operation's cancellation token fired before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored document body failed to parse. Bodies are validated on the
    /// way in, so this indicates corruption rather than caller error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else: actor channel closed, corrupted rows.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The HTTP status code this error would carry in a CouchDB response.
    pub fn status(&self) -> u16 {
        match self {
            Error::BadRequest(_) | Error::BadRev => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::PreconditionFailed => 412,
            Error::Cancelled | Error::Sqlite(_) | Error::Json(_) | Error::Internal(_) => 500,
        }
    }

    /// Shorthand for the generic `"conflict"` error.
    pub(crate) fn conflict() -> Self {
        Error::Conflict("conflict".into())
    }

    /// Shorthand for the generic `"not found"` error.
    pub(crate) fn not_found() -> Self {
        Error::NotFound("not found".into())
    }

    /// True when `err` is a SQLite UNIQUE-constraint violation. The write
    /// engine relies on this to detect already-known revision nodes during
    /// replication inserts.
    pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error {
                    code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                    extended_code: rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY,
                },
                _,
            )
        )
    }
}

/// A `Result` alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_couchdb() {
        assert_eq!(Error::BadRequest("x".into()).status(), 400);
        assert_eq!(Error::BadRev.status(), 400);
        assert_eq!(Error::not_found().status(), 404);
        assert_eq!(Error::conflict().status(), 409);
        assert_eq!(Error::PreconditionFailed.status(), 412);
        assert_eq!(Error::Cancelled.status(), 500);
        assert_eq!(Error::Internal("boom".into()).status(), 500);
    }

    #[test]
    fn display_is_the_bare_message() {
        assert_eq!(Error::conflict().to_string(), "conflict");
        assert_eq!(
            Error::BadRequest("Document ID must match _id in document".into()).to_string(),
            "Document ID must match _id in document"
        );
    }

    #[test]
    fn sqlite_errors_convert() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("x".into());
        let err: Error = sqlite_err.into();
        assert!(matches!(err, Error::Sqlite(_)));
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn unique_violation_detection() {
        let unique = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                extended_code: rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE,
            },
            Some("UNIQUE constraint failed".into()),
        );
        assert!(Error::is_unique_violation(&unique));

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy,
                extended_code: rusqlite::ffi::SQLITE_BUSY,
            },
            None,
        );
        assert!(!Error::is_unique_violation(&busy));
    }
}
