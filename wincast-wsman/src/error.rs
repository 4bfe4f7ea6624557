use thiserror::Error;

/// WS-Management fault code returned when a Receive saw no output within the
/// operation timeout.
pub const OPERATION_TIMEOUT_FAULT: &str = "2150858793";

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("authentication rejected by {url}")]
    Unauthorized { url: String },

    #[error("unexpected HTTP status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("WS-Management fault {code}: {message}")]
    Fault { code: String, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("remote command failed with exit code {exit_code}: {command}")]
    CommandFailed { command: String, exit_code: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this is the idle-receive timeout fault, which only means the
    /// command has not produced anything yet.
    pub fn is_operation_timeout(&self) -> bool {
        matches!(self, Error::Fault { code, .. } if code == OPERATION_TIMEOUT_FAULT)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
