use std::fmt;

/// Category of a cache error. Lets the engine decide between retrying
/// and failing fast without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration. Permanent, fail at startup.
    Config,
    /// Store cannot be reached right now (busy, locked, I/O). Retry.
    Unavailable,
    /// Persisted state is unreadable or inconsistent. Never guess, stop.
    Corrupt,
    /// A stored value has an unexpected shape.
    Format,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Unavailable => f.write_str("unavailable"),
            ErrorKind::Corrupt => f.write_str("corrupt"),
            ErrorKind::Format => f.write_str("format"),
        }
    }
}

/// Error returned by every `CacheStore` method.
#[derive(Clone)]
pub struct CacheError {
    kind: ErrorKind,
    message: String,
}

impl CacheError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Unavailable, message: msg.into() }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Corrupt, message: msg.into() }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Format, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Transient errors are worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Unavailable
    }

    /// Add context to the error, preserving the original ErrorKind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Debug for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CacheError {}
