use reqwest::{StatusCode, header::CONTENT_TYPE};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, trace};

use crate::{
    Endpoint, Parameters, envelope,
    error::{Error, Result},
    response::{self, ReceiveOutput, StreamName},
};

/// Extra time allowed on top of the operation timeout before an HTTP request
/// is abandoned, so that an idle Receive can return its timeout fault.
const RESPONSE_GRACE: Duration = Duration::from_secs(15);

/// A connection to one WinRM service. Cloning is cheap and shares the HTTP
/// connection pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    username: String,
    password: String,
    params: Parameters,
    http: reqwest::Client,
}

impl Client {
    pub fn new(
        endpoint: &Endpoint,
        username: &str,
        password: &str,
        params: Parameters,
    ) -> Result<Self> {
        let url = endpoint.url()?;
        let http = reqwest::Client::builder()
            .timeout(params.timeout + RESPONSE_GRACE)
            .connect_timeout(params.connect_timeout)
            .danger_accept_invalid_certs(endpoint.insecure)
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                username: username.to_string(),
                password: password.to_string(),
                params,
                http,
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn parameters(&self) -> &Parameters {
        &self.inner.params
    }

    /// POST one envelope and return the response body.
    async fn send(&self, message: String) -> Result<String> {
        let response = self
            .inner
            .http
            .post(&self.inner.url)
            .basic_auth(&self.inner.username, Some(&self.inner.password))
            .header(CONTENT_TYPE, "application/soap+xml;charset=UTF-8")
            .body(message)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return Ok(body);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized {
                url: self.inner.url.clone(),
            });
        }
        if let Some(fault) = response::fault(&body) {
            return Err(fault);
        }
        Err(Error::Http {
            status: status.as_u16(),
            body,
        })
    }

    /// Open a new remote `cmd` shell.
    pub async fn create_shell(&self) -> Result<Shell> {
        let body = self
            .send(envelope::create_shell(&self.inner.url, &self.inner.params))
            .await?;
        let id = response::shell_id(&body)?;
        debug!(shell = %id, url = %self.inner.url, "Opened remote shell");

        Ok(Shell {
            client: self.clone(),
            id,
        })
    }

    /// Run a command line in a fresh shell and collect everything it prints.
    pub async fn run(&self, command_line: &str) -> Result<Output> {
        let shell = self.create_shell().await?;
        let result = match shell.execute(command_line).await {
            Ok(command) => command.collect().await,
            Err(error) => Err(error),
        };

        if let Err(error) = shell.close().await {
            debug!(error = %error, "Failed to close remote shell");
        }
        result
    }
}

/// An open remote shell. Closing consumes it, so a shell is deleted at most
/// once.
pub struct Shell {
    client: Client,
    id: String,
}

impl Shell {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start a command line in this shell.
    pub async fn execute(&self, command_line: &str) -> Result<Command> {
        trace!(shell = %self.id, command_line, "Executing remote command");
        let body = self
            .client
            .send(envelope::command(
                self.client.url(),
                self.client.parameters(),
                &self.id,
                command_line,
            ))
            .await?;

        Ok(Command {
            client: self.client.clone(),
            shell_id: self.id.clone(),
            id: response::command_id(&body)?,
        })
    }

    /// Delete the shell on the remote side.
    pub async fn close(self) -> Result<()> {
        self.client
            .send(envelope::delete_shell(
                self.client.url(),
                self.client.parameters(),
                &self.id,
            ))
            .await?;
        debug!(shell = %self.id, "Closed remote shell");
        Ok(())
    }
}

/// Everything a finished command produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command running in a remote shell.
pub struct Command {
    client: Client,
    shell_id: String,
    id: String,
}

impl Command {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Poll once for output. An idle poll that hit the operation timeout
    /// yields an empty, unfinished result.
    pub async fn receive(&self) -> Result<ReceiveOutput> {
        let message = envelope::receive(
            self.client.url(),
            self.client.parameters(),
            &self.shell_id,
            &self.id,
        );
        match self.client.send(message).await {
            Ok(body) => response::receive_output(&body),
            Err(error) if error.is_operation_timeout() => {
                trace!(command = %self.id, "Receive timed out with no output");
                Ok(ReceiveOutput::default())
            }
            Err(error) => Err(error),
        }
    }

    /// Ask the service to terminate the command.
    pub async fn terminate(&self) -> Result<()> {
        self.client
            .send(envelope::signal(
                self.client.url(),
                self.client.parameters(),
                &self.shell_id,
                &self.id,
                envelope::SIGNAL_TERMINATE,
            ))
            .await
            .map(|_| ())
    }

    /// Pump stdout and stderr into the given writers until the command exits
    /// and return its exit code. Each stream is written by its own task so a
    /// slow writer on one never holds up the other; both are flushed before
    /// this returns.
    pub async fn copy_output<O, E>(self, stdout: O, stderr: E) -> Result<i32>
    where
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        self.pump(stdout, stderr).await.map(|(code, _, _)| code)
    }

    /// Wait for the command and buffer all of its output.
    pub async fn collect(self) -> Result<Output> {
        let (exit_code, stdout, stderr) = self.pump(Vec::new(), Vec::new()).await?;
        Ok(Output {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn pump<O, E>(self, stdout: O, stderr: E) -> Result<(i32, O, E)>
    where
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        let (stdout_tx, stdout_task) = spawn_writer(stdout);
        let (stderr_tx, stderr_task) = spawn_writer(stderr);

        let result = self.receive_until_done(&stdout_tx, &stderr_tx).await;

        // Closing the channels lets both writers drain and finish
        drop(stdout_tx);
        drop(stderr_tx);
        let stdout = join_writer(stdout_task).await;
        let stderr = join_writer(stderr_task).await;

        // Terminate on every path, including a failed writer
        if let Err(error) = self.terminate().await {
            trace!(error = %error, "Terminate after completion failed");
        }
        let code = result?;
        let (stdout, stderr) = (stdout?, stderr?);
        debug!(command = %self.id, exit_code = code, "Remote command finished");
        Ok((code, stdout, stderr))
    }

    async fn receive_until_done(
        &self,
        stdout: &mpsc::UnboundedSender<Vec<u8>>,
        stderr: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<i32> {
        loop {
            let output = self.receive().await?;
            for (stream, data) in output.chunks {
                let sender = match stream {
                    StreamName::Stdout => stdout,
                    StreamName::Stderr => stderr,
                };
                // A writer that already failed reports its error on join
                let _ = sender.send(data);
            }
            if output.done {
                return output.exit_code.ok_or_else(|| {
                    Error::Malformed(format!("command {} finished without an exit code", self.id))
                });
            }
        }
    }
}

fn spawn_writer<W>(
    mut writer: W,
) -> (
    mpsc::UnboundedSender<Vec<u8>>,
    JoinHandle<std::io::Result<W>>,
)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let task = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        Ok(writer)
    });
    (tx, task)
}

async fn join_writer<W>(task: JoinHandle<std::io::Result<W>>) -> Result<W> {
    match task.await {
        Ok(result) => Ok(result?),
        Err(error) => Err(Error::Io(std::io::Error::other(error))),
    }
}
