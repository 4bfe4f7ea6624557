//! A small WS-Management client for the Windows remote shell (WinRM).
//!
//! The client opens `cmd` shells over HTTP(S), runs command lines in them and
//! streams their output back. [`copy::CopyClient`] builds file uploads on top
//! of plain shell commands so no side channel is needed.

use std::{fmt::Display, time::Duration};

pub mod client;
pub mod copy;
pub mod duration;
pub mod envelope;
pub mod error;
pub mod powershell;
pub mod response;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{Client, Command, Output, Shell};
pub use copy::CopyClient;
pub use error::{Error, Result};

/// The default WinRM HTTP listener port.
pub const DEFAULT_PORT: u16 = 5985;

/// Where a WinRM service listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,

    /// Use HTTPS instead of plain HTTP
    pub https: bool,

    /// Skip certificate validation when using HTTPS
    pub insecure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            https: false,
            insecure: false,
        }
    }

    /// The service URL, for example `http://10.0.0.5:5985/wsman`.
    pub fn url(&self) -> crate::Result<String> {
        if self.host.is_empty() {
            return Err(Error::Endpoint("empty host".into()));
        }
        if self.port == 0 {
            return Err(Error::Endpoint(format!("invalid port for {}", self.host)));
        }

        let scheme = if self.https { "https" } else { "http" };
        if self.host.contains(':') && !self.host.starts_with('[') {
            Ok(format!("{scheme}://[{}]:{}/wsman", self.host, self.port))
        } else {
            Ok(format!("{scheme}://{}:{}/wsman", self.host, self.port))
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-request protocol settings.
#[derive(Clone, Debug)]
pub struct Parameters {
    /// Sent as `OperationTimeout`; also bounds each HTTP round trip
    pub timeout: Duration,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    pub locale: String,

    /// Largest response envelope the service may send, in bytes
    pub envelope_size: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            locale: String::from("en-US"),
            envelope_size: 153600,
        }
    }
}
