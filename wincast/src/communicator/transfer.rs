//! Moving files to the remote machine.
//!
//! Two strategies exist. [`CopyTransfer`] pushes data through the WinRM
//! session itself. [`HttpPull`] serves the file from a short-lived local HTTP
//! server and has the remote machine download it, which needs a route from
//! the guest back to the host.

use anyhow::Result;
use ignore::{WalkBuilder, overrides::OverrideBuilder};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};
use wincast_wsman::{CopyClient, powershell};

use super::{Communicator, run_command};
use crate::{error::Error, http::HttpServer};

/// Files that operating systems drop into directories on their own.
const SKIPPED_FILES: &[&str] = &[".DS_Store", "Thumbs.db"];

/// Convert a path to Windows separators.
pub fn win_path(path: &str) -> String {
    path.replace('/', "\\")
}

/// Join a relative local path onto a remote directory.
fn remote_path(dest: &str, relative: &Path) -> String {
    let mut path = win_path(dest).trim_end_matches('\\').to_string();
    for component in relative.components() {
        path.push('\\');
        path.push_str(&component.as_os_str().to_string_lossy());
    }
    path
}

/// Idempotent directory creation.
fn mkdir_command(path: &str) -> String {
    format!("cmd /c if not exist \"{path}\" mkdir \"{path}\"")
}

pub enum FileTransfer {
    HttpPull(HttpPull),
    Copy(CopyTransfer),
}

impl FileTransfer {
    pub async fn upload(
        &self,
        comm: &dyn Communicator,
        dest: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        match self {
            FileTransfer::HttpPull(http) => http.upload(comm, dest, input).await,
            FileTransfer::Copy(copy) => copy.upload(dest, input).await,
        }
    }

    /// Upload every file under `src` to the same relative location under
    /// `dest`. Each directory is created before anything inside it.
    pub async fn upload_dir(
        &self,
        comm: &dyn Communicator,
        dest: &str,
        src: &Path,
        exclude: &[String],
    ) -> Result<()> {
        let entries = {
            let src = src.to_path_buf();
            let exclude = exclude.to_vec();
            tokio::task::spawn_blocking(move || walk(&src, &exclude)).await??
        };
        info!(dest, src = ?src, entries = entries.len(), "Uploading directory");

        for entry in entries {
            let remote = remote_path(dest, &entry.relative);
            if entry.is_dir {
                let command = mkdir_command(&remote);
                let exit_status = run_command(comm, &command).await?;
                if exit_status != 0 {
                    return Err(Error::RemoteCommandFailed {
                        command,
                        exit_status,
                    }
                    .into());
                }
            } else {
                debug!(local = ?entry.path, remote, "Uploading file");
                let mut file = tokio::fs::File::open(&entry.path).await?;
                self.upload(comm, &remote, &mut file).await?;
            }
        }
        Ok(())
    }
}

struct TreeEntry {
    path: PathBuf,
    relative: PathBuf,
    is_dir: bool,
}

/// List `src` depth first, parents before children, siblings by name.
fn walk(src: &Path, exclude: &[String]) -> Result<Vec<TreeEntry>> {
    let mut overrides = OverrideBuilder::new(src);
    for pattern in exclude {
        overrides.add(&format!("!{pattern}"))?;
    }

    let walker = WalkBuilder::new(src)
        .standard_filters(false)
        .overrides(overrides.build()?)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry?;
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_FILES.contains(&name))
        {
            continue;
        }

        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() && !file_type.is_file() {
            continue;
        }

        entries.push(TreeEntry {
            relative: entry.path().strip_prefix(src)?.to_path_buf(),
            path: entry.path().to_path_buf(),
            is_dir: file_type.is_dir(),
        });
    }
    Ok(entries)
}

/// Serve the file over HTTP and have the guest fetch it.
pub struct HttpPull {
    /// The host's address as seen from the guest
    pub address: String,
    pub port_min: u16,
    pub port_max: u16,
}

impl HttpPull {
    pub async fn upload(
        &self,
        comm: &dyn Communicator,
        dest: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let name = format!("wincast-{}", uuid::Uuid::new_v4());
        let server = HttpServer::new()?
            .file(&name, input)
            .await?
            .serve(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port_min, self.port_max)
            .await?;

        let url = format!("http://{}:{}/{name}", self.address, server.port);
        let command = fetch_command(&url, &win_path(dest));
        let result = run_command(comm, &command).await;
        server.shutdown().await;

        let exit_status = result?;
        if exit_status != 0 {
            return Err(Error::RemoteCommandFailed {
                command,
                exit_status,
            }
            .into());
        }
        Ok(())
    }
}

fn fetch_command(url: &str, dest: &str) -> String {
    format!(
        "powershell -NoProfile -Command \"Invoke-WebRequest -UseBasicParsing -Uri '{url}' -OutFile {}\"",
        powershell::quote(dest)
    )
}

/// Push the file through the WinRM session.
pub struct CopyTransfer {
    client: CopyClient,
}

impl CopyTransfer {
    pub fn new(client: CopyClient) -> Self {
        Self { client }
    }

    pub async fn upload(&self, dest: &str, input: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()> {
        let mut data = Vec::new();
        input.read_to_end(&mut data).await?;

        self.client
            .write(&win_path(dest), &data)
            .await
            .map_err(|error| match error {
                wincast_wsman::Error::CommandFailed { command, exit_code } => {
                    Error::RemoteCommandFailed {
                        command,
                        exit_status: exit_code,
                    }
                    .into()
                }
                other => anyhow::Error::from(other),
            })
    }
}
