use anyhow::{Context, Result};
use std::{path::Path, process::ExitCode};
use tracing::{error, info};

use super::Connection;
use crate::communicator::Communicator;

async fn upload(connection: &Connection, from: &Path, to: &str) -> Result<()> {
    let mut file = tokio::fs::File::open(from)
        .await
        .with_context(|| format!("Failed to open {}", from.display()))?;

    let comm = connection.connect().await?;
    comm.upload(to, &mut file).await?;
    info!(from = %from.display(), to, "Uploaded file");
    Ok(())
}

async fn upload_dir(
    connection: &Connection,
    from: &Path,
    to: &str,
    exclude: &[String],
) -> Result<()> {
    if !from.is_dir() {
        anyhow::bail!("{} is not a directory", from.display());
    }

    let comm = connection.connect().await?;
    comm.upload_dir(to, from, exclude).await?;
    info!(from = %from.display(), to, "Uploaded directory");
    Ok(())
}

fn block_on(future: impl std::future::Future<Output = Result<()>>) -> ExitCode {
    let runtime = match super::runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(error = ?error, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(future) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = ?error, "Upload failed");
            ExitCode::FAILURE
        }
    }
}

pub fn run(connection: &Connection, from: &Path, to: &str) -> ExitCode {
    block_on(upload(connection, from, to))
}

pub fn run_dir(connection: &Connection, from: &Path, to: &str, exclude: &[String]) -> ExitCode {
    block_on(upload_dir(connection, from, to, exclude))
}
