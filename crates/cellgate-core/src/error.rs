use thiserror::Error;

/// Errors produced by the cellgate protocol and proxy layers.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("message parse error: {0}")]
    MessageParse(String),

    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("kernel deletion failed: {0}")]
    Deletion(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::MessageParse(e.to_string())
    }
}

pub type GateResult<T> = Result<T, GateError>;
