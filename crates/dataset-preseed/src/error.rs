use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Other,
    Config,
    InvalidPath,
    InvalidPathSuffix,
    RestoreMethodFailed,
    AllMethodsExhausted,
    MarkerWriteFailed,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    /// Process exit code reported to the supervisor.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::AllMethodsExhausted => 2,
            ErrorKind::MarkerWriteFailed => 3,
            ErrorKind::InvalidPathSuffix => 4,
            ErrorKind::Cancelled => 130,
            _ => 1,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
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
        Self::msg(err.to_string())
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
    fn fatal_kinds_have_distinct_exit_codes() {
        let exhausted = ErrorKind::AllMethodsExhausted.exit_code();
        let marker = ErrorKind::MarkerWriteFailed.exit_code();
        assert_ne!(exhausted, 0);
        assert_ne!(marker, 0);
        assert_ne!(exhausted, marker);
        assert_eq!(ErrorKind::Config.exit_code(), 1);
    }

    #[test]
    fn msg_defaults_to_other() {
        let e = Error::msg("boom");
        assert_eq!(e.kind(), ErrorKind::Other);
        assert_eq!(e.to_string(), "boom");
    }
}
