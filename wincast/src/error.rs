//! Error kinds that callers need to tell apart. Everything else travels as a
//! plain [`anyhow::Error`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A polling loop ran past its deadline.
    #[error("timeout waiting for {waiting_for}")]
    Timeout { waiting_for: String },

    /// A polling loop saw the build being cancelled.
    #[error("cancelled while waiting for {waiting_for}")]
    Cancelled { waiting_for: String },

    #[error(
        "the private key is protected by a passphrase; provide an unencrypted key to decrypt the administrator password"
    )]
    PassphraseProtectedKey,

    #[error("{operation} is not supported by this communicator")]
    NotSupported { operation: String },

    /// A remote command used to move files exited non-zero.
    #[error("upload failed: `{command}` exited with status {exit_status}")]
    RemoteCommandFailed { command: String, exit_status: i32 },

    /// The machine has no usable address yet.
    #[error("no address available yet for {resource}")]
    NoAddress { resource: String },

    #[error("no open port in range {lower}-{upper}")]
    PortRangeExhausted { lower: u16, upper: u16 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn timeout(waiting_for: &str) -> Self {
        Self::Timeout {
            waiting_for: waiting_for.to_string(),
        }
    }

    pub fn cancelled(waiting_for: &str) -> Self {
        Self::Cancelled {
            waiting_for: waiting_for.to_string(),
        }
    }

    pub fn not_supported(operation: &str) -> Self {
        Self::NotSupported {
            operation: operation.to_string(),
        }
    }
}
