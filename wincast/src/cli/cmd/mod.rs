use anyhow::Result;
use std::{path::PathBuf, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use wincast_wsman::Endpoint;

use crate::{
    communicator::{WinRmCommunicator, winrm::ConnectOptions},
    config::{HttpConfig, TransferMode, WinRmConfig},
};

pub mod exec;
pub mod provision;
pub mod upload;

/// How to reach the machine.
#[derive(clap::Args, Debug, Clone)]
pub struct Connection {
    #[clap(long, global = true, default_value = "localhost")]
    pub host: String,

    #[clap(long, global = true, default_value_t = wincast_wsman::DEFAULT_PORT)]
    pub port: u16,

    #[clap(long, global = true, default_value = "Administrator")]
    pub user: String,

    #[clap(long, global = true)]
    pub password: Option<String>,

    /// Timeout for each WinRM operation
    #[clap(long, global = true, default_value = "60s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    #[clap(long, global = true, num_args = 0)]
    pub https: bool,

    /// Skip certificate verification when using HTTPS
    #[clap(long, global = true, num_args = 0)]
    pub insecure: bool,

    /// How files are moved to the machine
    #[clap(long, global = true, value_enum, default_value_t = TransferMode::Copy)]
    pub transfer: TransferMode,

    /// This host's address as seen from the machine, for HTTP transfers
    #[clap(long, global = true, default_value = "10.0.2.2")]
    pub http_address: String,

    /// Log at debug level
    #[clap(long, global = true, num_args = 0)]
    pub debug: bool,
}

impl Connection {
    pub fn winrm_config(&self) -> WinRmConfig {
        WinRmConfig {
            username: self.user.clone(),
            password: self.password.clone(),
            host: Some(self.host.clone()),
            port: self.port,
            operation_timeout: self.timeout,
            https: self.https,
            insecure: self.insecure,
            transfer: self.transfer,
            ..WinRmConfig::default()
        }
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            address: self.http_address.clone(),
            ..HttpConfig::default()
        }
    }

    /// Connect once, without waiting for the machine.
    pub async fn connect(&self) -> Result<WinRmCommunicator> {
        let endpoint = Endpoint {
            host: self.host.clone(),
            port: self.port,
            https: self.https,
            insecure: self.insecure,
        };
        let options = ConnectOptions::from_config(&self.winrm_config(), &self.http_config());

        WinRmCommunicator::connect(
            endpoint,
            &self.user,
            self.password.as_deref().unwrap_or_default(),
            &options,
        )
        .await
    }
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a command on the machine and exit with its status
    Exec {
        /// Run through the task scheduler with full administrative rights
        #[clap(long, num_args = 0)]
        elevated: bool,

        #[clap(index = 1)]
        command: String,
    },

    /// Upload a file
    Upload {
        #[clap(long)]
        from: PathBuf,

        /// The remote destination path
        #[clap(long)]
        to: String,
    },

    /// Upload a directory
    UploadDir {
        #[clap(long)]
        from: PathBuf,

        /// The remote directory to recreate the local one under
        #[clap(long)]
        to: String,

        /// Glob patterns of files to leave behind
        #[clap(long)]
        exclude: Vec<String>,
    },

    /// Wait for the machine and run the provisioners of a project
    Provision {
        /// The context directory (containing a wincast config file)
        #[clap(index = 1, default_value = ".")]
        path: PathBuf,
    },
}

/// A runtime for one command.
fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// Cancel `cancel` when the user presses Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    warn!("Interrupted, cancelling");
                    cancel.cancel();
                }
            }
            _ = cancel.cancelled() => {}
        }
    });
}
