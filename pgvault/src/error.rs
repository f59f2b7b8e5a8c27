//! The error taxonomy shared by every subsystem.

use camino::Utf8PathBuf;
use utils::lsn::Lsn;

/// Everything that can go wrong in the backup core. The kinds are
/// closed: workflow stages and the CLI map them onto exit codes, and the
/// retention/delete logic branches on them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt data in {what}")]
    Corrupt { what: String },

    #[error("WAL ends prematurely after {last_good_lsn}")]
    Truncated { last_good_lsn: Lsn },

    #[error("authentication to the database server failed: {0}")]
    Auth(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflicting operation already running: {0}")]
    Conflict(String),

    #[error("backup {0} is retained (keep is set)")]
    Retained(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("unsupported version: {0}")]
    VersionMismatch(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a filesystem error with the path it concerns.
    pub fn io(path: impl AsRef<camino::Utf8Path>, source: std::io::Error) -> Error {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn corrupt(what: impl Into<String>) -> Error {
        Error::Corrupt { what: what.into() }
    }

    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Auth(_) => 2,
            Error::Config(_) => 3,
            Error::Conflict(_) => 4,
            Error::Retained(_) => 5,
            _ => 1,
        }
    }
}

impl From<wal_decoder::reader::WalReaderError> for Error {
    fn from(e: wal_decoder::reader::WalReaderError) -> Error {
        use wal_decoder::reader::WalReaderError;
        match e {
            WalReaderError::Corrupt { lsn, msg } => Error::Corrupt {
                what: format!("WAL record at {lsn}: {msg}"),
            },
            WalReaderError::Truncated { last_good_lsn, .. } => Error::Truncated { last_good_lsn },
            WalReaderError::TimelineSwitchMidRecord { lsn } => Error::Corrupt {
                what: format!("record at {lsn} continues across a timeline switch"),
            },
            WalReaderError::VersionMismatch(v) => {
                Error::VersionMismatch(format!("PostgreSQL major {v}"))
            }
            WalReaderError::Io { path, source } => Error::Io { path, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_cli_contract() {
        assert_eq!(Error::Auth("x".into()).exit_code(), 2);
        assert_eq!(Error::Config("x".into()).exit_code(), 3);
        assert_eq!(Error::Conflict("x".into()).exit_code(), 4);
        assert_eq!(Error::Retained("x".into()).exit_code(), 5);
        assert_eq!(Error::NotFound("x".into()).exit_code(), 1);
        assert_eq!(
            Error::io("/nowhere", std::io::Error::from(std::io::ErrorKind::Other)).exit_code(),
            1
        );
    }
}
