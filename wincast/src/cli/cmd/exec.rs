use anyhow::Result;
use std::process::ExitCode;
use tracing::{debug, error};

use super::Connection;
use crate::communicator::{Communicator, RemoteCommand};

/// The process exit code for a remote exit status. Statuses that do not fit,
/// including a lost status, become a plain failure.
fn exit_code(exit_status: i32) -> u8 {
    u8::try_from(exit_status).unwrap_or(1)
}

async fn exec(connection: &Connection, elevated: bool, command: &str) -> Result<i32> {
    let comm = connection.connect().await?;

    let mut cmd = RemoteCommand::new(command)
        .stdout(tokio::io::stdout())
        .stderr(tokio::io::stderr());
    if elevated {
        comm.start_elevated(&mut cmd).await?;
    } else {
        comm.start(&mut cmd).await?;
    }

    let exit_status = cmd.wait().await;
    debug!(command, exit_status, "Command finished");
    Ok(exit_status)
}

pub fn run(connection: &Connection, elevated: bool, command: &str) -> ExitCode {
    let runtime = match super::runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(error = ?error, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(exec(connection, elevated, command)) {
        Ok(exit_status) => ExitCode::from(exit_code(exit_status)),
        Err(error) => {
            error!(error = ?error, "Failed to run command");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(3), 3);
        assert_eq!(exit_code(-1), 1);
        assert_eq!(exit_code(1115), 1);
    }
}
