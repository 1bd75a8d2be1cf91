//! Error reporting.
//!
//! Two layers: [`Status`] is the fixed-capacity record that lives on long-lived
//! objects (parser, symbol table) and survives without allocating; [`Error`] is
//! the owned value returned by fallible entry points.

use core::fmt;

/// Maximum message bytes a [`Status`] can hold before ellipsizing.
pub const MAX_STATUS_MESSAGE: usize = 127;

/// Coarse failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// Malformed varint, bad wire type, bad JSON token, bad base64, bad default string.
    #[error("invalid input")]
    InvalidInput,
    /// Unknown type name, duplicate field, label/syntax rule violation.
    #[error("schema violation")]
    SchemaViolation,
    /// Value out of declared range, too-deep nesting, field number 0.
    #[error("range error")]
    RangeError,
    /// Buffer ends mid-value.
    #[error("truncated input")]
    Truncated,
    /// Arena allocation failure.
    #[error("out of memory")]
    OutOfMemory,
    /// `Any` missing `@type`, unknown packed type.
    #[error("unresolved reference")]
    Unresolved,
}

/// Owned error value for `Result`-returning operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }
}

/// Fixed-capacity error record. One per operation; the message is truncated
/// with an ellipsis when it exceeds [`MAX_STATUS_MESSAGE`].
pub struct Status {
    ok: bool,
    kind: ErrorKind,
    len: u8,
    msg: [u8; MAX_STATUS_MESSAGE],
}

impl Default for Status {
    fn default() -> Self {
        Status {
            ok: true,
            kind: ErrorKind::InvalidInput,
            len: 0,
            msg: [0; MAX_STATUS_MESSAGE],
        }
    }
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        // Only ever filled from &str input, truncated on a char boundary.
        core::str::from_utf8(&self.msg[..self.len as usize]).unwrap_or("")
    }

    pub fn clear(&mut self) {
        self.ok = true;
        self.len = 0;
    }

    /// Record an error. Keeps the first error; later calls are ignored so the
    /// root cause survives.
    pub fn set_error(&mut self, kind: ErrorKind, message: &str) {
        if !self.ok {
            return;
        }
        self.ok = false;
        self.kind = kind;
        let bytes = message.as_bytes();
        if bytes.len() <= MAX_STATUS_MESSAGE {
            self.msg[..bytes.len()].copy_from_slice(bytes);
            self.len = bytes.len() as u8;
        } else {
            let mut cut = MAX_STATUS_MESSAGE - 3;
            while cut > 0 && !message.is_char_boundary(cut) {
                cut -= 1;
            }
            self.msg[..cut].copy_from_slice(&bytes[..cut]);
            self.msg[cut..cut + 3].copy_from_slice(b"...");
            self.len = (cut + 3) as u8;
        }
    }

    pub fn to_error(&self) -> Option<Error> {
        if self.ok {
            None
        } else {
            Some(Error::new(self.kind, self.message()))
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ok {
            write!(f, "Status(ok)")
        } else {
            write!(f, "Status({:?}: {})", self.kind, self.message())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_read() {
        let mut s = Status::new();
        assert!(s.is_ok());
        s.set_error(ErrorKind::Truncated, "buffer ended early");
        assert!(!s.is_ok());
        assert_eq!(s.kind(), ErrorKind::Truncated);
        assert_eq!(s.message(), "buffer ended early");
    }

    #[test]
    fn first_error_wins() {
        let mut s = Status::new();
        s.set_error(ErrorKind::RangeError, "first");
        s.set_error(ErrorKind::InvalidInput, "second");
        assert_eq!(s.kind(), ErrorKind::RangeError);
        assert_eq!(s.message(), "first");
    }

    #[test]
    fn long_message_ellipsized() {
        let mut s = Status::new();
        let long = "x".repeat(500);
        s.set_error(ErrorKind::InvalidInput, &long);
        assert_eq!(s.message().len(), MAX_STATUS_MESSAGE);
        assert!(s.message().ends_with("..."));
    }
}
