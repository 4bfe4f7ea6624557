//! File upload over plain shell commands.
//!
//! The payload is base64 encoded and appended, one independently decodable
//! line per command, to a temporary file on the remote side with `echo`. A
//! PowerShell script then decodes the temporary file into the destination.
//! A shell only accepts a limited number of commands, so a fresh one is opened
//! every `max_operations_per_shell` commands.

use base64::{Engine, engine::general_purpose::STANDARD};
use tracing::{debug, info, warn};

use crate::{
    Client, powershell,
    error::{Error, Result},
};

/// `cmd.exe` refuses command lines longer than 8191 characters; stay well
/// below that.
const MAX_COMMAND_LINE: usize = 8000;

pub const DEFAULT_MAX_OPERATIONS_PER_SHELL: usize = 15;

pub struct CopyClient {
    client: Client,
    max_operations_per_shell: usize,
}

impl CopyClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            max_operations_per_shell: DEFAULT_MAX_OPERATIONS_PER_SHELL,
        }
    }

    pub fn with_max_operations_per_shell(mut self, operations: usize) -> Self {
        self.max_operations_per_shell = operations.max(1);
        self
    }

    /// Write `data` to the remote file `dest`, replacing it if present and
    /// creating its parent directory if missing.
    pub async fn write(&self, dest: &str, data: &[u8]) -> Result<()> {
        let dest = dest.replace('/', "\\");
        let name = format!("winrmcp-{}.tmp", uuid::Uuid::new_v4());
        let temp = format!("%TEMP%\\{name}");

        info!(dest, bytes = data.len(), "Copying file to remote host");
        let result = match self.append_chunks(&temp, data).await {
            Ok(()) => self.restore(&name, &dest).await,
            Err(error) => Err(error),
        };

        match self.client.run(&format!("del /q \"{temp}\"")).await {
            Ok(output) if !output.success() => {
                warn!(temp, exit_code = output.exit_code, "Failed to remove temporary file");
            }
            Err(error) => {
                warn!(temp, error = %error, "Failed to remove temporary file");
            }
            Ok(_) => {}
        }
        result
    }

    async fn append_chunks(&self, temp: &str, data: &[u8]) -> Result<()> {
        let chunk_size = ((MAX_COMMAND_LINE - temp.len()) / 4) * 3;
        let mut chunks = data.chunks(chunk_size).peekable();

        while chunks.peek().is_some() {
            let shell = self.client.create_shell().await?;
            let mut result = Ok(());

            for chunk in chunks.by_ref().take(self.max_operations_per_shell) {
                let command_line = format!("echo {} >> \"{temp}\"", STANDARD.encode(chunk));
                result = match shell.execute(&command_line).await {
                    Ok(command) => match command.collect().await {
                        Ok(output) if output.success() => Ok(()),
                        Ok(output) => Err(Error::CommandFailed {
                            command: format!("append to {temp}"),
                            exit_code: output.exit_code,
                        }),
                        Err(error) => Err(error),
                    },
                    Err(error) => Err(error),
                };
                if result.is_err() {
                    break;
                }
            }

            if let Err(error) = shell.close().await {
                debug!(error = %error, "Failed to close copy shell");
            }
            result?;
        }
        Ok(())
    }

    async fn restore(&self, temp_name: &str, dest: &str) -> Result<()> {
        let script = restore_script(temp_name, dest);
        let output = self.client.run(&powershell::command(&script)).await?;
        if !output.success() {
            debug!(stderr = %String::from_utf8_lossy(&output.stderr), "Restore failed");
            return Err(Error::CommandFailed {
                command: format!("restore {dest}"),
                exit_code: output.exit_code,
            });
        }
        Ok(())
    }
}

fn restore_script(temp_name: &str, dest: &str) -> String {
    format!(
        r#"$ErrorActionPreference = 'Stop'
$tmp_file_path = [System.IO.Path]::GetFullPath("$env:TEMP\{temp_name}")
$dest_file_path = [System.IO.Path]::GetFullPath({dest})
if (Test-Path $dest_file_path) {{
    Remove-Item $dest_file_path -Force
}} else {{
    $dest_dir = [System.IO.Path]::GetDirectoryName($dest_file_path)
    New-Item -ItemType Directory -Force -ErrorAction SilentlyContinue -Path $dest_dir | Out-Null
}}
if (Test-Path $tmp_file_path) {{
    $reader = [System.IO.File]::OpenText($tmp_file_path)
    $writer = [System.IO.File]::OpenWrite($dest_file_path)
    try {{
        for (;;) {{
            $line = $reader.ReadLine()
            if ($line -eq $null) {{ break }}
            $bytes = [System.Convert]::FromBase64String($line)
            $writer.Write($bytes, 0, $bytes.Length)
        }}
    }} finally {{
        $reader.Close()
        $writer.Close()
    }}
}} else {{
    New-Item -ItemType File -Force -Path $dest_file_path | Out-Null
}}
"#,
        dest = powershell::quote(dest),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockServer, Reply};

    fn appended(commands: &[String]) -> Vec<u8> {
        commands
            .iter()
            .filter(|command| command.starts_with("echo "))
            .flat_map(|command| {
                let line = command.split_whitespace().nth(1).unwrap();
                STANDARD.decode(line).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_write_chunks_and_reassembles() {
        let server = MockServer::start("u", "p", |_| Reply::success())
            .await
            .unwrap();
        let copy = CopyClient::new(server.client("u", "p").unwrap())
            .with_max_operations_per_shell(2);

        let data: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        copy.write("C:/Windows/Temp/app/data.bin", &data).await.unwrap();

        let commands = server.commands();
        let echoes = commands.iter().filter(|c| c.starts_with("echo ")).count();
        assert_eq!(echoes, 4);
        assert!(commands.iter().all(|c| c.len() < 8191));
        assert_eq!(appended(&commands), data);

        // Two shells of appends, then the restore and the cleanup
        assert_eq!(server.shells_created(), 4);
        assert_eq!(server.shells_deleted(), 4);
        assert!(commands[4].starts_with("powershell.exe "));
        assert!(commands[5].starts_with("del /q \"%TEMP%\\winrmcp-"));
    }

    #[tokio::test]
    async fn test_write_empty_file() {
        let server = MockServer::start("u", "p", |_| Reply::success())
            .await
            .unwrap();
        let copy = CopyClient::new(server.client("u", "p").unwrap());

        copy.write("C:\\empty.txt", &[]).await.unwrap();

        let commands = server.commands();
        assert_eq!(commands.len(), 2, "{commands:?}");
        assert!(commands[0].starts_with("powershell.exe "));
    }

    #[tokio::test]
    async fn test_write_failure_still_cleans_up() {
        let server = MockServer::start("u", "p", |command| {
            if command.starts_with("echo ") {
                Reply::output("", "Access is denied.", 5)
            } else {
                Reply::success()
            }
        })
        .await
        .unwrap();
        let copy = CopyClient::new(server.client("u", "p").unwrap());

        let result = copy.write("C:\\locked\\file.txt", b"payload").await;
        assert!(matches!(
            result,
            Err(Error::CommandFailed { exit_code: 5, .. })
        ));

        let commands = server.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[1].starts_with("del /q "));
    }

    #[test]
    fn test_restore_script_quotes_destination() {
        let script = restore_script("winrmcp-x.tmp", "C:\\it's\\here.txt");
        assert!(script.contains("GetFullPath('C:\\it''s\\here.txt')"));
        assert!(script.contains("\"$env:TEMP\\winrmcp-x.tmp\""));
    }
}
