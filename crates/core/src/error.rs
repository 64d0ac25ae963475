use libris_files::FilesError;
use libris_types::NameError;

/// Which size ceiling an upload exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeLimit {
    /// The global per-request ceiling, checked against the declared `Content-Length`
    Request,
    /// The ceiling for one extension, checked against the actual payload
    Extension(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("malformed multipart request: {0}")]
    MalformedMultipart(String),
    #[error("file type not allowed: {extension}")]
    ExtensionRejected {
        extension: String,
        allowed: Vec<String>,
    },
    #[error("payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: u64, scope: SizeLimit },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(FilesError),
    #[error("failed to read catalog: {0}")]
    CatalogRead(std::io::Error),
    #[error("failed to write catalog: {0}")]
    CatalogWrite(std::io::Error),
    #[error("failed to serialize catalog: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to hash stored file: {0}")]
    Hash(std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LibraryError {
    /// Whether the error was caused by the request rather than by the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LibraryError::InvalidPath(_)
                | LibraryError::MalformedMultipart(_)
                | LibraryError::ExtensionRejected { .. }
                | LibraryError::PayloadTooLarge { .. }
                | LibraryError::InvalidJson(_)
                | LibraryError::InvalidInput(_)
        )
    }

    /// Human-readable specifics for error responses, where there is more to say than the
    /// error message itself.
    pub fn detail(&self) -> Option<String> {
        match self {
            LibraryError::ExtensionRejected { allowed, .. } => {
                Some(format!("Allowed extensions: {}", allowed.join(", ")))
            }
            LibraryError::PayloadTooLarge { limit, scope } => Some(match scope {
                SizeLimit::Request => format!(
                    "Maximum request size is {} bytes ({:.2} GB)",
                    limit,
                    libris_types::size_in_gb(*limit)
                ),
                SizeLimit::Extension(ext) => format!(
                    "Maximum size for {} files is {} bytes ({:.2} MB)",
                    ext,
                    limit,
                    libris_types::size_in_mb(*limit)
                ),
            }),
            _ => None,
        }
    }
}

impl From<FilesError> for LibraryError {
    fn from(err: FilesError) -> Self {
        match err {
            FilesError::NotFound(name) => LibraryError::NotFound(name),
            FilesError::InvalidName(e) => LibraryError::InvalidPath(e.to_string()),
            other => LibraryError::Storage(other),
        }
    }
}

impl From<NameError> for LibraryError {
    fn from(err: NameError) -> Self {
        LibraryError::InvalidPath(err.to_string())
    }
}

pub type LibraryResult<T> = std::result::Result<T, LibraryError>;
