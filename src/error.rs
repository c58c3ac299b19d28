use thiserror::Error;

/// Result alias for fallible crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a share link was rejected. Never leaves a profile half-populated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("link does not start with ss://")]
    MissingScheme,

    #[error("base64 decode failed")]
    InvalidBase64,

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid port number: {0}")]
    InvalidPort(String),
}

/// Failures of `ProcessSupervisor::start`. Fatal to the connect attempt only.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{program} not found. {hint}")]
    NotInstalled { program: String, hint: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot resolve the user config directory")]
    NoConfigDir,

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no subscription named {0:?}")]
    UnknownSubscription(String),

    #[error("subscription {0:?} already exists")]
    DuplicateSubscription(String),

    #[error("subscription returned no servers")]
    EmptySubscription,

    #[error("no server at index {0}")]
    BadIndex(usize),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("session controller is no longer running")]
    SessionClosed,
}

impl DecodeError {
    pub fn code(&self) -> &'static str {
        "IMPORT_INVALID"
    }
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::NotInstalled { .. } => "SSLOCAL_MISSING",
            SupervisorError::Spawn { .. } => "START_FAILED",
        }
    }
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NoConfigDir => "PATH_ERROR",
            StoreError::Io { .. } => "STATE_IO",
            StoreError::Json { .. } => "PROFILE_INVALID",
            StoreError::UnknownSubscription(_) | StoreError::BadIndex(_) => "NOT_FOUND",
            StoreError::DuplicateSubscription(_) => "SUB_EXISTS",
            StoreError::EmptySubscription => "SUB_EMPTY",
        }
    }
}

impl Error {
    /// Stable tag for front-ends, e.g. `SSLOCAL_MISSING`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Decode(e) => e.code(),
            Error::Supervisor(e) => e.code(),
            Error::Store(e) => e.code(),
            Error::SessionClosed => "SESSION_CLOSED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_wrapped_error() {
        let err: Error = DecodeError::MissingScheme.into();
        assert_eq!(err.code(), "IMPORT_INVALID");

        let err: Error = SupervisorError::NotInstalled {
            program: "sslocal".into(),
            hint: "sudo dnf install shadowsocks-rust".into(),
        }
        .into();
        assert_eq!(err.code(), "SSLOCAL_MISSING");
        assert_eq!(
            err.to_string(),
            "sslocal not found. sudo dnf install shadowsocks-rust"
        );
    }
}
