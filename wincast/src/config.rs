use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    time::Duration,
};
use validator::{Validate, ValidationError};

use crate::{error::Error, provisioners::Provisioner};

/// How files reach the remote machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Push data through the WinRM session
    #[default]
    Copy,

    /// Serve files from a local HTTP server for the machine to download
    Http,
}

fn default_port() -> u16 {
    wincast_wsman::DEFAULT_PORT
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_operations_per_shell() -> usize {
    wincast_wsman::copy::DEFAULT_MAX_OPERATIONS_PER_SHELL
}

fn positive(duration: &Duration) -> Result<(), ValidationError> {
    if duration.is_zero() {
        return Err(ValidationError::new("positive_duration"));
    }
    Ok(())
}

/// Connection settings for the WinRM communicator.
#[derive(Clone, Serialize, Deserialize, Validate, Debug)]
pub struct WinRmConfig {
    #[validate(length(min = 1))]
    pub username: String,

    /// Absent when the password is generated by the machine and discovered
    /// by an earlier step
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// How long to wait for WinRM to become available
    #[serde(default = "default_wait_timeout", with = "humantime_serde")]
    #[validate(custom(function = "positive"))]
    pub wait_timeout: Duration,

    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    #[validate(custom(function = "positive"))]
    pub operation_timeout: Duration,

    #[serde(default)]
    pub https: bool,

    /// Skip certificate verification when using HTTPS
    #[serde(default)]
    pub insecure: bool,

    #[serde(default)]
    pub transfer: TransferMode,

    #[serde(default = "default_max_operations_per_shell")]
    #[validate(range(min = 1))]
    pub max_operations_per_shell: usize,
}

impl Default for WinRmConfig {
    fn default() -> Self {
        Self {
            username: String::from("Administrator"),
            password: None,
            host: None,
            port: default_port(),
            wait_timeout: default_wait_timeout(),
            operation_timeout: default_operation_timeout(),
            https: false,
            insecure: false,
            transfer: TransferMode::default(),
            max_operations_per_shell: default_max_operations_per_shell(),
        }
    }
}

fn check_http_ports(config: &HttpConfig) -> Result<(), ValidationError> {
    if config.port_min >= config.port_max {
        return Err(ValidationError::new("port_range")
            .with_message("port_min must be less than port_max".into()));
    }
    Ok(())
}

/// The local file server used by HTTP transfers.
#[derive(Clone, Serialize, Deserialize, Validate, Debug, PartialEq, Eq)]
#[validate(schema(function = "check_http_ports"))]
pub struct HttpConfig {
    /// The host's address as seen from inside the machine
    #[validate(length(min = 1))]
    pub address: String,
    pub port_min: u16,
    pub port_max: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: String::from("10.0.2.2"),
            port_min: 8000,
            port_max: 9000,
        }
    }
}

fn check_forward_ports(config: &ForwardConfig) -> Result<(), ValidationError> {
    if config.host_port_min >= config.host_port_max {
        return Err(ValidationError::new("port_range")
            .with_message("host_port_min must be less than host_port_max".into()));
    }
    Ok(())
}

/// Host ports available for forwarding to the machine's WinRM listener.
#[derive(Clone, Serialize, Deserialize, Validate, Debug, PartialEq, Eq)]
#[validate(schema(function = "check_forward_ports"))]
pub struct ForwardConfig {
    pub host_port_min: u16,
    pub host_port_max: u16,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            host_port_min: 4985,
            host_port_max: 6985,
        }
    }
}

/// A complete provisioning run.
#[derive(Clone, Serialize, Deserialize, Validate, Debug)]
pub struct Template {
    #[validate(nested)]
    pub winrm: WinRmConfig,

    #[serde(default)]
    #[validate(nested)]
    pub http: HttpConfig,

    #[serde(default)]
    #[validate(nested)]
    pub forward: ForwardConfig,

    #[serde(default)]
    pub provisioners: Vec<Provisioner>,
}

impl Template {
    /// Validate the template and every provisioner in it.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|error| Error::Config(error.to_string()))?;

        for (index, provisioner) in self.provisioners.iter().enumerate() {
            provisioner
                .validate()
                .map_err(|error| Error::Config(format!("provisioner {index}: {error}")))?;
        }
        Ok(())
    }
}

/// A configuration file in one of the supported formats.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigPath {
    Json(PathBuf),
    Toml(PathBuf),
    Yaml(PathBuf),
}

impl Display for ConfigPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

impl ConfigPath {
    /// Check for a configuration file in the given directory.
    pub fn from_dir(path: impl AsRef<Path>) -> Option<ConfigPath> {
        let path = path.as_ref();

        if path.join("wincast.json").exists() {
            return Some(ConfigPath::Json(path.join("wincast.json")));
        }

        if path.join("wincast.toml").exists() {
            return Some(ConfigPath::Toml(path.join("wincast.toml")));
        }

        if path.join("wincast.yaml").exists() {
            return Some(ConfigPath::Yaml(path.join("wincast.yaml")));
        } else if path.join("wincast.yml").exists() {
            return Some(ConfigPath::Yaml(path.join("wincast.yml")));
        }

        None
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Json(path) | Self::Toml(path) | Self::Yaml(path) => path,
        }
    }

    /// Read and validate the template.
    pub fn load(&self) -> Result<Template> {
        let contents = std::fs::read_to_string(self.path())
            .with_context(|| format!("Failed to read {self}"))?;

        let template: Template = match self {
            Self::Json(_) => serde_json::from_str(&contents)?,
            Self::Toml(_) => toml::from_str(&contents)?,
            Self::Yaml(_) => serde_yaml::from_str(&contents)?,
        };
        template.check()?;
        Ok(template)
    }
}
