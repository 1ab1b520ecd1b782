use std::fmt;

/// Broad failure classes callers branch on. The message carries the detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or ambiguous provider, missing secret key, bad run definition.
    Config,
    /// Non-zero exit, spawn/wait failure, write or close failure on a pipe.
    Process,
    /// Malformed tool output where a single document was expected.
    Parse,
    /// A lock holder did not go away before the wait budget ran out.
    LockTimeout,
    /// Listing or inspecting a lock or its holder failed.
    LockQuery,
    Cancelled,
    DeadlineExceeded,
    Io,
    Other,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "configuration error",
            ErrorKind::Process => "process execution error",
            ErrorKind::Parse => "parse error",
            ErrorKind::LockTimeout => "lock timeout",
            ErrorKind::LockQuery => "lock query error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeadlineExceeded => "deadline exceeded",
            ErrorKind::Io => "io error",
            ErrorKind::Other => "error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn process<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Process, msg)
    }

    pub fn parse<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Parse, msg)
    }

    pub fn io<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn lock_timeout<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::LockTimeout, msg)
    }

    pub fn lock_query<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::LockQuery, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "context cancelled")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorKind::DeadlineExceeded, "context deadline exceeded")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Prefix the message while keeping the kind, e.g. to name the backend.
    pub fn context(self, prefix: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{prefix}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let e = Error::process("exit status 1").context("backend 's3-main'");
        assert_eq!(e.kind(), ErrorKind::Process);
        assert_eq!(e.to_string(), "backend 's3-main': exit status 1");
    }

    #[test]
    fn io_errors_map_to_io_kind() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(e.kind(), ErrorKind::Io);
    }
}
