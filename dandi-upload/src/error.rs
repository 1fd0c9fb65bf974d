use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur while uploading to the archive
#[derive(Error, Debug)]
pub enum UploadError {
    /// Client and server disagree on the upload contract (part plan, response shape)
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// A checksum reported by storage or the archive differs from the local one
    #[error("Checksum mismatch for {context}: expected {expected}, got {actual}")]
    Integrity {
        context: String,
        expected: String,
        actual: String,
    },

    /// The local file no longer matches what was declared when the upload started
    #[error("File {path} changed during upload")]
    ContentChanged { path: String },

    #[error("Archive returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("HTTP transport error: {source}")]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("XML decode error: {source}")]
    Xml {
        #[from]
        source: quick_xml::DeError,
    },

    #[error("Background task failed: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
}

impl UploadError {
    pub fn protocol<S: Into<String>>(reason: S) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn integrity<C, E, A>(context: C, expected: E, actual: A) -> Self
    where
        C: Into<String>,
        E: Into<String>,
        A: Into<String>,
    {
        Self::Integrity {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn content_changed<S: Into<String>>(path: S) -> Self {
        Self::ContentChanged { path: path.into() }
    }

    pub fn api<S: Into<String>>(status: u16, body: S) -> Self {
        Self::Api {
            status,
            body: body.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// True for errors that mean the uploaded bytes cannot be trusted
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Integrity { .. } | Self::ContentChanged { .. })
    }
}
