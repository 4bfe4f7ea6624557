use anyhow::{Context, Result};
use async_trait::async_trait;
use std::{path::Path, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};
use wincast_wsman::{Client, CopyClient, Endpoint, Parameters};

use super::{
    Communicator, LOST_EXIT_STATUS, RemoteCommand,
    elevated::ElevatedScript,
    transfer::{CopyTransfer, FileTransfer, HttpPull},
};
use crate::{
    config::{HttpConfig, TransferMode, WinRmConfig},
    error::Error,
    resolver::Address,
    steps::connect::Connect,
};

/// How connections are made once an address is known.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub https: bool,
    pub insecure: bool,
    pub operation_timeout: Duration,
    pub transfer: TransferMode,
    pub max_operations_per_shell: usize,
    pub http: HttpConfig,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_config(&WinRmConfig::default(), &HttpConfig::default())
    }
}

impl ConnectOptions {
    pub fn from_config(winrm: &WinRmConfig, http: &HttpConfig) -> Self {
        Self {
            https: winrm.https,
            insecure: winrm.insecure,
            operation_timeout: winrm.operation_timeout,
            transfer: winrm.transfer,
            max_operations_per_shell: winrm.max_operations_per_shell,
            http: http.clone(),
        }
    }
}

/// Runs commands and moves files over WinRM.
pub struct WinRmCommunicator {
    client: Client,
    user: String,
    password: String,
    transfer: FileTransfer,
}

impl WinRmCommunicator {
    /// Connect and make sure the service accepts our credentials by opening
    /// and closing a shell.
    pub async fn connect(
        endpoint: Endpoint,
        user: &str,
        password: &str,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let params = Parameters {
            timeout: options.operation_timeout,
            ..Parameters::default()
        };
        let client = Client::new(&endpoint, user, password, params)?;

        let shell = client
            .create_shell()
            .await
            .with_context(|| format!("Failed to open a shell on {endpoint}"))?;
        shell.close().await?;
        info!(%endpoint, user, "Connected to WinRM");

        let transfer = match options.transfer {
            TransferMode::Copy => FileTransfer::Copy(CopyTransfer::new(
                CopyClient::new(client.clone())
                    .with_max_operations_per_shell(options.max_operations_per_shell),
            )),
            TransferMode::Http => FileTransfer::HttpPull(HttpPull {
                address: options.http.address.clone(),
                port_min: options.http.port_min,
                port_max: options.http.port_max,
            }),
        };

        Ok(Self {
            client,
            user: user.to_string(),
            password: password.to_string(),
            transfer,
        })
    }

    /// Open a shell, issue `command_line` and pump its output into `cmd` in
    /// the background.
    async fn run_in_shell(&self, command_line: &str, cmd: &mut RemoteCommand) -> Result<()> {
        let shell = self.client.create_shell().await?;
        let command = match shell.execute(command_line).await {
            Ok(command) => command,
            Err(error) => {
                if let Err(error) = shell.close().await {
                    debug!(error = %error, "Failed to close remote shell");
                }
                return Err(error.into());
            }
        };

        let (stdout, stderr, exit) = cmd.begin();
        tokio::spawn(async move {
            let code = match command.copy_output(stdout, stderr).await {
                Ok(code) => code,
                Err(error) => {
                    error!(error = %error, "Lost track of remote command");
                    LOST_EXIT_STATUS
                }
            };
            if let Err(error) = shell.close().await {
                debug!(error = %error, "Failed to close remote shell");
            }
            exit.exited(code);
        });
        Ok(())
    }
}

#[async_trait]
impl Communicator for WinRmCommunicator {
    async fn start(&self, cmd: &mut RemoteCommand) -> Result<()> {
        debug!(command = %cmd.command, "Starting remote command");
        let command_line = cmd.command.clone();
        self.run_in_shell(&command_line, cmd).await
    }

    async fn start_elevated(&self, cmd: &mut RemoteCommand) -> Result<()> {
        info!(command = %cmd.command, "Starting elevated remote command");
        let script = ElevatedScript::new(&cmd.command, &self.user, &self.password);
        self.upload(&script.path, &mut script.contents.as_bytes())
            .await
            .context("Failed to upload the elevated command wrapper")?;

        self.run_in_shell(&script.command(), cmd).await
    }

    async fn upload(&self, dest: &str, input: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()> {
        self.transfer.upload(self, dest, input).await
    }

    async fn upload_dir(&self, dest: &str, src: &Path, exclude: &[String]) -> Result<()> {
        self.transfer.upload_dir(self, dest, src, exclude).await
    }

    async fn download(
        &self,
        _src: &str,
        _output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        Err(Error::not_supported("download").into())
    }
}

/// Opens [`WinRmCommunicator`]s for the connection step.
pub struct WinRmConnector {
    pub options: ConnectOptions,
}

#[async_trait]
impl Connect for WinRmConnector {
    async fn connect(
        &self,
        address: &Address,
        user: &str,
        password: &str,
    ) -> Result<Arc<dyn Communicator>> {
        let endpoint = Endpoint {
            host: address.host.clone(),
            port: address.port,
            https: self.options.https,
            insecure: self.options.insecure,
        };
        Ok(Arc::new(
            WinRmCommunicator::connect(endpoint, user, password, &self.options).await?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{CommandStatus, SharedBuffer};
    use wincast_wsman::testing::{MockServer, Reply};

    async fn server() -> MockServer {
        MockServer::start("vagrant", "vagrant", |command| match command {
            "hostname" => Reply::output("WIN-BUILD\r\n", "", 0),
            "noisy" => Reply::new(
                "o".repeat(10_000),
                "e".repeat(10_000),
                42,
            )
            .chunked(1000),
            _ => Reply::success(),
        })
        .await
        .unwrap()
    }

    async fn connect(server: &MockServer) -> WinRmCommunicator {
        WinRmCommunicator::connect(
            server.endpoint().clone(),
            "vagrant",
            "vagrant",
            &ConnectOptions::default(),
        )
        .await
        .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_opens_and_closes_a_shell() {
        let server = server().await;
        connect(&server).await;

        assert_eq!(server.shells_created(), 1);
        assert_eq!(server.shells_deleted(), 1);
        assert!(server.commands().is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let server = server().await;
        let result = WinRmCommunicator::connect(
            server.endpoint().clone(),
            "vagrant",
            "wrong",
            &ConnectOptions::default(),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let server = server().await;
        let comm = connect(&server).await;

        let stdout = SharedBuffer::default();
        let stderr = SharedBuffer::default();
        let mut cmd = RemoteCommand::new("noisy")
            .stdout(stdout.clone())
            .stderr(stderr.clone());
        assert_eq!(cmd.exit_status(), None);

        comm.start(&mut cmd).await.unwrap();
        assert_ne!(cmd.status(), CommandStatus::Pending);

        assert_eq!(cmd.wait().await, 42);
        assert_eq!(cmd.exit_status(), Some(42));
        assert_eq!(stdout.contents(), "o".repeat(10_000).into_bytes());
        assert_eq!(stderr.contents(), "e".repeat(10_000).into_bytes());

        // Probe shell plus the command's own
        assert_eq!(server.shells_deleted(), 2);
    }

    #[tokio::test]
    async fn test_upload_with_copy_protocol() {
        let server = server().await;
        let comm = connect(&server).await;

        let mut input: &[u8] = b"Write-Host hi";
        comm.upload("C:/Windows/Temp/hi.ps1", &mut input).await.unwrap();

        let commands = server.commands();
        assert!(commands[0].starts_with("echo "));
        assert!(commands[1].starts_with("powershell.exe "));
        assert!(commands[2].starts_with("del /q "));
    }

    #[tokio::test]
    async fn test_upload_dir_with_copy_protocol() {
        let server = server().await;
        let comm = connect(&server).await;

        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("dir/sub")).unwrap();
        std::fs::write(root.path().join("dir/sub/file.txt"), "x").unwrap();
        std::fs::write(root.path().join("dir/sub/.DS_Store"), "junk").unwrap();

        comm.upload_dir("C:/dest", root.path(), &[]).await.unwrap();

        let commands = server.commands();
        let mkdirs: Vec<&String> = commands.iter().filter(|c| c.contains("mkdir")).collect();
        assert_eq!(mkdirs.len(), 3);
        let first_echo = commands.iter().position(|c| c.starts_with("echo ")).unwrap();
        assert_eq!(first_echo, 3, "{commands:#?}");
        assert_eq!(commands.iter().filter(|c| c.starts_with("echo ")).count(), 1);
    }

    #[tokio::test]
    async fn test_start_elevated_uploads_wrapper() {
        let server = server().await;
        let comm = connect(&server).await;

        let mut cmd = RemoteCommand::new("net start wuauserv");
        comm.start_elevated(&mut cmd).await.unwrap();
        assert_eq!(cmd.wait().await, 0);

        let commands = server.commands();
        assert!(commands.iter().any(|c| c.starts_with("echo ")));
        let last = commands.last().unwrap();
        assert!(
            last.starts_with(
                "powershell -NoProfile -ExecutionPolicy Bypass -File \"C:\\Windows\\Temp\\wincast-elevated-shell-"
            ),
            "{last}"
        );
        assert!(last.ends_with(".ps1\""));
    }

    #[tokio::test]
    async fn test_download_not_supported() {
        let server = server().await;
        let comm = connect(&server).await;

        let mut output = Vec::new();
        let error = comm.download("C:/file", &mut output).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::NotSupported { .. })
        ));
    }
}
