use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no Codex credentials found in the auth file or keychain")]
    NoCredentialsFound,
    #[error("malformed credential JSON: {0}")]
    MalformedJson(String),
    #[error("keychain read failed (status {status}): {message}")]
    SecretStoreReadFailed { status: i32, message: String },
    #[error("keychain write failed (status {status}): {message}")]
    SecretStoreWriteFailed { status: i32, message: String },
    #[error("profile has no CLI credentials: {0}")]
    ProfileHasNoCliCredential(String),
    #[error("cannot delete the last remaining profile")]
    CannotDeleteLastProfile,
    #[error("current Codex login has expired; run `codex login` and try again")]
    CurrentLoginExpired,
    #[error("failed to reload profiles after sync: {0}")]
    ProfileReloadAfterSyncFailed(String),
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("invalid profile name: {0:?}")]
    InvalidProfileName(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Usage(String),
}

impl SyncError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            _ => 1,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
