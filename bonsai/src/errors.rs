use backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::result::Result;

use crate::common::{atomic, Atomic};

/// Error kinds for bonsai operations
///
/// Each kind names one category of failure so that callers (the document
/// layer or an atomic operation commit path) can decide whether to abort the
/// enclosing unit of work.
///
/// # Examples
///
/// ```rust,ignore
/// use bonsai::errors::{BonsaiError, ErrorKind, BonsaiResult};
///
/// fn example() -> BonsaiResult<()> {
///     Err(BonsaiError::new("Tree is still in use", ErrorKind::InUse))
/// }
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    // Handle cache errors
    /// A tree was deleted or evicted while borrows were outstanding
    InUse,
    /// A usage counter was driven below zero
    UnbalancedRelease,

    // Link collection errors
    /// The operation is not supported in this direction
    UnsupportedOperation,
    /// A record without persistent identity reached serialization
    UnresolvableRecord,
    /// The operation is not valid in the current state
    InvalidOperation,

    // IO and Storage Errors
    /// Generic IO error
    IOError,
    /// The file was not found
    FileNotFound,
    /// Permission denied for file operation
    PermissionDenied,
    /// Error accessing file
    FileAccessError,
    /// Tree pages do not have the expected shape
    StructuralCorruption,

    // Data Encoding Errors
    /// Malformed binary header or container
    EncodingError,

    // Event Errors
    /// Error in change listener processing
    EventError,

    /// Configuration value rejected by validation
    ValidationError,

    /// Internal error (usually indicates a bug)
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InUse => write!(f, "In use"),
            ErrorKind::UnbalancedRelease => write!(f, "Unbalanced release"),
            ErrorKind::UnsupportedOperation => write!(f, "Unsupported operation"),
            ErrorKind::UnresolvableRecord => write!(f, "Unresolvable record"),
            ErrorKind::InvalidOperation => write!(f, "Invalid operation"),
            ErrorKind::IOError => write!(f, "IO error"),
            ErrorKind::FileNotFound => write!(f, "File not found"),
            ErrorKind::PermissionDenied => write!(f, "Permission denied"),
            ErrorKind::FileAccessError => write!(f, "File access error"),
            ErrorKind::StructuralCorruption => write!(f, "Structural corruption"),
            ErrorKind::EncodingError => write!(f, "Encoding error"),
            ErrorKind::EventError => write!(f, "Event error"),
            ErrorKind::ValidationError => write!(f, "Validation error"),
            ErrorKind::InternalError => write!(f, "Internal error"),
        }
    }
}

impl ErrorKind {
    /// Returns `true` for kinds that signal a broken invariant rather than a
    /// recoverable condition. Such errors are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::InUse
                | ErrorKind::UnbalancedRelease
                | ErrorKind::StructuralCorruption
                | ErrorKind::UnresolvableRecord
        )
    }
}

/// Custom bonsai error type.
///
/// `BonsaiError` carries the error message, kind and an optional cause. It
/// supports error chaining and keeps a backtrace captured at construction.
///
/// # Examples
///
/// ```rust,ignore
/// use bonsai::errors::{BonsaiError, ErrorKind};
///
/// let cause = BonsaiError::new("disk unplugged", ErrorKind::IOError);
/// let err = BonsaiError::new_with_cause("Failed to open collections_3.sbc", ErrorKind::IOError, cause);
/// ```
#[derive(Clone)]
pub struct BonsaiError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<BonsaiError>>,
    backtrace: Atomic<Backtrace>,
}

impl BonsaiError {
    /// Creates a new `BonsaiError` with the specified message and error kind.
    ///
    /// # Arguments
    ///
    /// * `message` - A description of the error
    /// * `error_kind` - The category of error
    ///
    /// # Returns
    ///
    /// A new `BonsaiError` instance.
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        BonsaiError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: atomic(Backtrace::new()),
        }
    }

    /// Creates a new `BonsaiError` with a cause error.
    ///
    /// # Arguments
    ///
    /// * `message` - A description of the error
    /// * `error_kind` - The category of error
    /// * `cause` - The underlying error that caused this error
    ///
    /// # Returns
    ///
    /// A new `BonsaiError` instance with the cause error attached.
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: BonsaiError) -> Self {
        BonsaiError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: atomic(Backtrace::new()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&BonsaiError> {
        self.cause.as_deref()
    }
}

impl Display for BonsaiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Debug for BonsaiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // print error message with stack trace followed by cause
        match &self.cause {
            Some(cause) => write!(f, "{}\nCaused by: {:?}", self.message, cause),
            None => write!(f, "{}\n{:?}", self.message, self.backtrace.read()),
        }
    }
}

impl Error for BonsaiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// A result type alias for bonsai operations.
pub type BonsaiResult<T> = Result<T, BonsaiError>;

impl From<std::io::Error> for BonsaiError {
    fn from(err: std::io::Error) -> Self {
        let error_kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::IOError,
        };
        BonsaiError::new(&format!("IO error: {}", err), error_kind)
    }
}

impl From<String> for BonsaiError {
    fn from(msg: String) -> Self {
        BonsaiError::new(&msg, ErrorKind::InternalError)
    }
}

impl From<&str> for BonsaiError {
    fn from(msg: &str) -> Self {
        BonsaiError::new(msg, ErrorKind::InternalError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bonsai_error_new_creates_error() {
        let error = BonsaiError::new("tree is borrowed", ErrorKind::InUse);
        assert_eq!(error.message(), "tree is borrowed");
        assert_eq!(error.kind(), &ErrorKind::InUse);
        assert!(error.cause().is_none());
    }

    #[test]
    fn bonsai_error_new_with_cause_keeps_chain() {
        let cause = BonsaiError::new("short read", ErrorKind::IOError);
        let error = BonsaiError::new_with_cause("failed to open", ErrorKind::FileAccessError, cause);
        assert_eq!(error.kind(), &ErrorKind::FileAccessError);
        assert_eq!(error.cause().map(|c| c.message()), Some("short read"));
        assert!(error.source().is_some());
    }

    #[test]
    fn bonsai_error_display_shows_message_only() {
        let error = BonsaiError::new("bad header", ErrorKind::EncodingError);
        assert_eq!(format!("{}", error), "bad header");
    }

    #[test]
    fn bonsai_error_debug_includes_cause() {
        let cause = BonsaiError::new("inner", ErrorKind::IOError);
        let error = BonsaiError::new_with_cause("outer", ErrorKind::IOError, cause);
        let debug = format!("{:?}", error);
        assert!(debug.contains("outer"));
        assert!(debug.contains("Caused by: inner"));
    }

    #[test]
    fn io_error_maps_to_kind() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(BonsaiError::from(not_found).kind(), &ErrorKind::FileNotFound);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert_eq!(BonsaiError::from(denied).kind(), &ErrorKind::PermissionDenied);

        let other = std::io::Error::other("boom");
        assert_eq!(BonsaiError::from(other).kind(), &ErrorKind::IOError);
    }

    #[test]
    fn string_conversions_are_internal_errors() {
        assert_eq!(BonsaiError::from("x").kind(), &ErrorKind::InternalError);
        assert_eq!(BonsaiError::from("y".to_string()).kind(), &ErrorKind::InternalError);
    }

    #[test]
    fn fatal_kinds() {
        assert!(ErrorKind::InUse.is_fatal());
        assert!(ErrorKind::UnbalancedRelease.is_fatal());
        assert!(ErrorKind::StructuralCorruption.is_fatal());
        assert!(ErrorKind::UnresolvableRecord.is_fatal());
        assert!(!ErrorKind::IOError.is_fatal());
        assert!(!ErrorKind::UnsupportedOperation.is_fatal());
    }

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::StructuralCorruption.to_string(), "Structural corruption");
        assert_eq!(ErrorKind::InUse.to_string(), "In use");
    }
}
