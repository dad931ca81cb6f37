use std::path::Path;

pub type Result<T> = std::result::Result<T, SutError>;

#[derive(Debug, thiserror::Error)]
pub enum SutError {
    #[error("misconfiguration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {status} {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("stream completed without producing any token")]
    EmptyStream,

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("failed to decode cached outputs: {path}")]
    CacheDecode { path: String },

    #[error("queue disconnected")]
    Disconnected,

    #[error("thread panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SutError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation(message.into())
    }

    pub fn cache_decode(path: impl AsRef<Path>) -> Self {
        Self::CacheDecode {
            path: path.as_ref().display().to_string(),
        }
    }

    pub fn http_status(status: reqwest::StatusCode) -> Self {
        Self::HttpStatus {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        }
    }

    /// Whether a retry policy is allowed to try the call again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::HttpStatus { .. } | Self::Io(_) | Self::EmptyStream
        )
    }
}

// reqwest also reports a body cut short by the peer as a decode error, so
// nothing coming out of it is a shape mismatch. Bodies are parsed with
// `backend::parse_body` instead.
impl From<reqwest::Error> for SutError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<tokenizers::Error> for SutError {
    fn from(value: tokenizers::Error) -> Self {
        Self::Tokenizer(value.to_string())
    }
}
