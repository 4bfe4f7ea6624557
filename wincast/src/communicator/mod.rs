//! A communicator runs commands on, and moves files to, a machine being built.

use anyhow::Result;
use async_trait::async_trait;
use std::{path::Path, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};
use tracing::debug;

use crate::error::Error;

pub mod elevated;
pub mod sink;
pub mod transfer;
pub mod winrm;

pub use sink::{SharedBuffer, UiSink};
pub use winrm::{WinRmCommunicator, WinRmConnector};

/// The exit status reported when a command's outcome could not be observed,
/// for example because the connection dropped while it ran.
pub const LOST_EXIT_STATUS: i32 = -1;

pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Running,
    Exited(i32),
}

/// A command to run remotely, together with where its output goes.
pub struct RemoteCommand {
    pub command: String,
    stdout: Option<OutputSink>,
    stderr: Option<OutputSink>,
    status: Arc<watch::Sender<CommandStatus>>,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        let (status, _) = watch::channel(CommandStatus::Pending);
        Self {
            command: command.into(),
            stdout: None,
            stderr: None,
            status: Arc::new(status),
        }
    }

    pub fn stdout(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(sink));
        self
    }

    pub fn stderr(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(sink));
        self
    }

    pub fn status(&self) -> CommandStatus {
        *self.status.borrow()
    }

    /// The exit status, once the command has exited.
    pub fn exit_status(&self) -> Option<i32> {
        match self.status() {
            CommandStatus::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// Block until the command has exited and all of its output has been
    /// written. Only meaningful after a successful `start`.
    pub fn wait(&self) -> impl Future<Output = i32> + Send + use<> {
        let mut status = self.status.subscribe();
        async move {
            let exited = status
                .wait_for(|status| matches!(status, CommandStatus::Exited(_)))
                .await
                .map(|status| *status);

            match exited {
                Ok(CommandStatus::Exited(code)) => code,
                _ => LOST_EXIT_STATUS,
            }
        }
    }

    /// Take the output sinks and mark the command running. Missing sinks
    /// discard their output.
    pub fn begin(&mut self) -> (OutputSink, OutputSink, ExitReporter) {
        let stdout = self
            .stdout
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::sink()));
        let stderr = self
            .stderr
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::sink()));

        self.status.send_replace(CommandStatus::Running);
        let exit = ExitReporter {
            status: self.status.clone(),
            reported: false,
        };
        (stdout, stderr, exit)
    }
}

/// Lets whoever pumps a command's output record how it ended. Dropping it
/// without reporting marks the exit status as lost.
pub struct ExitReporter {
    status: Arc<watch::Sender<CommandStatus>>,
    reported: bool,
}

impl ExitReporter {
    pub fn exited(mut self, code: i32) {
        self.status.send_replace(CommandStatus::Exited(code));
        self.reported = true;
    }
}

impl Drop for ExitReporter {
    fn drop(&mut self) {
        if !self.reported {
            self.status.send_if_modified(|status| match status {
                CommandStatus::Exited(_) => false,
                _ => {
                    *status = CommandStatus::Exited(LOST_EXIT_STATUS);
                    true
                }
            });
        }
    }
}

#[async_trait]
pub trait Communicator: Send + Sync {
    /// Start a command. Returns once the command is running; use
    /// [`RemoteCommand::wait`] for the outcome.
    async fn start(&self, cmd: &mut RemoteCommand) -> Result<()>;

    /// Start a command with full administrative rights.
    async fn start_elevated(&self, cmd: &mut RemoteCommand) -> Result<()> {
        let _ = cmd;
        Err(Error::not_supported("elevated execution").into())
    }

    /// Write the contents of `input` to the remote file `dest`.
    async fn upload(&self, dest: &str, input: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()>;

    /// Recreate the local directory `src` under the remote directory `dest`.
    async fn upload_dir(&self, dest: &str, src: &Path, exclude: &[String]) -> Result<()>;

    async fn download(&self, src: &str, output: &mut (dyn AsyncWrite + Send + Unpin))
    -> Result<()>;
}

/// Run a command to completion and return its exit status. Output is only
/// logged.
pub async fn run_command(comm: &dyn Communicator, command: &str) -> Result<i32> {
    let stdout = SharedBuffer::default();
    let stderr = SharedBuffer::default();
    let mut cmd = RemoteCommand::new(command)
        .stdout(stdout.clone())
        .stderr(stderr.clone());

    comm.start(&mut cmd).await?;
    let exit_status = cmd.wait().await;

    debug!(
        command,
        exit_status,
        stdout = %stdout.to_string_lossy(),
        stderr = %stderr.to_string_lossy(),
        "Remote command finished"
    );
    Ok(exit_status)
}


#[cfg(test)]
mod tests {
    use super::*;
    use fake::FakeCommunicator;

    #[tokio::test]
    async fn test_lifecycle() {
        let comm = FakeCommunicator::default().exit_with("false", 1);
        let stdout = SharedBuffer::default();
        let mut cmd = RemoteCommand::new("false").stdout(stdout.clone());

        assert_eq!(cmd.status(), CommandStatus::Pending);
        assert_eq!(cmd.exit_status(), None);

        comm.start(&mut cmd).await.unwrap();
        assert_eq!(cmd.wait().await, 1);
        assert_eq!(cmd.status(), CommandStatus::Exited(1));
        assert_eq!(cmd.exit_status(), Some(1));
        assert_eq!(stdout.to_string_lossy(), "ran false\n");
    }

    #[tokio::test]
    async fn test_dropped_reporter_loses_exit_status() {
        let mut cmd = RemoteCommand::new("whoami");
        let (_stdout, _stderr, exit) = cmd.begin();
        assert_eq!(cmd.status(), CommandStatus::Running);

        let wait = cmd.wait();
        drop(exit);

        let exit_status = tokio::time::timeout(std::time::Duration::from_secs(5), wait)
            .await
            .unwrap();
        assert_eq!(exit_status, LOST_EXIT_STATUS);
        assert_eq!(cmd.exit_status(), Some(LOST_EXIT_STATUS));
    }

    #[tokio::test]
    async fn test_reporter_panic_loses_exit_status() {
        let mut cmd = RemoteCommand::new("whoami");
        let (_stdout, _stderr, exit) = cmd.begin();

        let task = tokio::spawn(async move {
            let _exit = exit;
            panic!("output pump failed");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(cmd.wait().await, LOST_EXIT_STATUS);
    }

    #[tokio::test]
    async fn test_reported_exit_survives_drop() {
        let mut cmd = RemoteCommand::new("whoami");
        let (_stdout, _stderr, exit) = cmd.begin();
        exit.exited(7);

        assert_eq!(cmd.wait().await, 7);
    }

    #[tokio::test]
    async fn test_run_command() {
        let comm = FakeCommunicator::default();
        assert_eq!(run_command(&comm, "echo").await.unwrap(), 0);
        assert_eq!(comm.commands(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_elevated_unsupported_by_default() {
        let comm = FakeCommunicator::default();
        let mut cmd = RemoteCommand::new("whoami");

        let error = comm.start_elevated(&mut cmd).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::NotSupported { .. })
        ));
    }
}
