//! Provisioners run against a connected machine to configure it.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, warn};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    communicator::{Communicator, RemoteCommand, UiSink},
    context::BuildContext,
    ui::Ui,
};

pub mod powershell;
pub mod restart;
pub mod windows_shell;

pub use powershell::Powershell;
pub use restart::WindowsRestart;
pub use windows_shell::WindowsShell;

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Provisioner {
    WindowsShell(WindowsShell),
    Powershell(Powershell),
    WindowsRestart(WindowsRestart),
}

impl Validate for Provisioner {
    fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            Provisioner::WindowsShell(shell) => shell.validate(),
            Provisioner::Powershell(powershell) => powershell.validate(),
            Provisioner::WindowsRestart(restart) => restart.validate(),
        }
    }
}

impl Provisioner {
    pub fn name(&self) -> &'static str {
        match self {
            Provisioner::WindowsShell(_) => "windows-shell",
            Provisioner::Powershell(_) => "powershell",
            Provisioner::WindowsRestart(_) => "windows-restart",
        }
    }

    pub async fn provision(
        &self,
        ctx: &Arc<BuildContext>,
        comm: &Arc<dyn Communicator>,
    ) -> Result<()> {
        match self {
            Provisioner::WindowsShell(shell) => shell.provision(ctx, comm).await,
            Provisioner::Powershell(powershell) => powershell.provision(ctx, comm).await,
            Provisioner::WindowsRestart(restart) => restart.provision(ctx, comm).await,
        }
    }
}

pub(crate) fn default_start_retry_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

pub(crate) fn default_retry_sleep() -> Duration {
    Duration::from_secs(2)
}

/// Retry `f` until it succeeds or `timeout` has passed. Only use this for
/// operations that are safe to repeat, such as starting a command.
pub async fn retryable<T, F, Fut>(timeout: Duration, sleep: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if Instant::now() >= deadline {
                    return Err(error.context("Gave up retrying"));
                }
                warn!(error = %format!("{error:#}"), "Retryable error");
                tokio::time::sleep(sleep).await;
            }
        }
    }
}

/// Start a command whose output goes to the user.
pub async fn start_with_ui(
    comm: &dyn Communicator,
    ui: &Arc<dyn Ui>,
    command: &str,
    elevated: bool,
) -> Result<RemoteCommand> {
    let mut cmd = RemoteCommand::new(command)
        .stdout(UiSink::new(ui.clone()))
        .stderr(UiSink::new(ui.clone()));

    if elevated {
        comm.start_elevated(&mut cmd).await?;
    } else {
        comm.start(&mut cmd).await?;
    }
    Ok(cmd)
}

/// One script to upload and run.
pub(crate) struct Script {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Gather the scripts to run: the inline commands as a single script, or
/// each script file in order.
pub(crate) async fn collect_scripts(inline: &[String], scripts: &[PathBuf]) -> Result<Vec<Script>> {
    if !inline.is_empty() {
        let mut contents = String::new();
        for line in inline {
            contents.push_str(line);
            contents.push_str("\r\n");
        }
        return Ok(vec![Script {
            name: String::from("inline script"),
            contents: contents.into_bytes(),
        }]);
    }

    let mut collected = Vec::with_capacity(scripts.len());
    for path in scripts {
        collected.push(Script {
            name: path.display().to_string(),
            contents: tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?,
        });
    }
    Ok(collected)
}

/// How a script is placed on the machine and started.
pub(crate) struct ScriptRunner<'a> {
    pub remote_path: &'a str,
    pub command: String,
    pub elevated: bool,
    pub start_retry_timeout: Duration,
    pub retry_sleep: Duration,
}

impl ScriptRunner<'_> {
    pub async fn run(
        &self,
        ctx: &BuildContext,
        comm: &Arc<dyn Communicator>,
        script: Script,
    ) -> Result<()> {
        ctx.ui.say(&format!("Provisioning with {}", script.name));
        debug!(remote_path = self.remote_path, bytes = script.contents.len(), "Uploading script");

        let comm = comm.as_ref();
        let ui = &ctx.ui;
        let command = self.command.as_str();
        let elevated = self.elevated;

        let cmd = retryable(self.start_retry_timeout, self.retry_sleep, move || {
            let contents = script.contents.clone();
            async move {
                comm.upload(self.remote_path, &mut contents.as_slice()).await?;
                start_with_ui(comm, ui, command, elevated).await
            }
        })
        .await?;

        let exit_status = cmd.wait().await;
        if exit_status != 0 {
            bail!("Script exited with non-zero exit status: {exit_status}");
        }
        Ok(())
    }
}

/// Exactly one of inline commands or script files must be given.
fn check_sources(inline: &[String], scripts: &[PathBuf]) -> Result<(), ValidationError> {
    match (inline.is_empty(), scripts.is_empty()) {
        (true, true) => Err(ValidationError::new("sources")
            .with_message("one of inline or scripts must be given".into())),
        (false, false) => Err(ValidationError::new("sources")
            .with_message("only one of inline or scripts may be given".into())),
        _ => {
            if let Some(missing) = scripts.iter().find(|script| !script.is_file()) {
                return Err(ValidationError::new("scripts")
                    .with_message(format!("script not found: {}", missing.display()).into()));
            }
            Ok(())
        }
    }
}

/// Environment variables are given as `KEY=VALUE`.
fn check_environment(vars: &[String]) -> Result<(), ValidationError> {
    for var in vars {
        match var.split_once('=') {
            Some((key, _)) if !key.is_empty() => {}
            _ => {
                return Err(ValidationError::new("environment_vars")
                    .with_message(format!("expected KEY=VALUE: {var}").into()));
            }
        }
    }
    Ok(())
}

/// Split `KEY=VALUE` pairs. Validation guarantees the separator.
fn environment(vars: &[String]) -> impl Iterator<Item = (&str, &str)> {
    vars.iter().filter_map(|var| var.split_once('='))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retryable_succeeds() {
        let calls = &AtomicUsize::new(0);
        let value = retryable(Duration::from_secs(5), Duration::from_millis(1), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("not yet");
            }
            Ok("done")
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retryable_gives_up() {
        let calls = &AtomicUsize::new(0);
        let result: Result<()> =
            retryable(Duration::from_millis(20), Duration::from_millis(5), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("never")
            })
            .await;

        assert!(format!("{:#}", result.unwrap_err()).contains("never"));
        assert!(calls.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_check_environment() {
        assert!(check_environment(&[String::from("A=1"), String::from("B=")]).is_ok());
        assert!(check_environment(&[String::from("A")]).is_err());
        assert!(check_environment(&[String::from("=1")]).is_err());
    }

    #[test]
    fn test_environment_values_keep_separators() {
        let vars = [String::from("URL=http://x/?a=b")];
        assert_eq!(
            environment(&vars).collect::<Vec<_>>(),
            vec![("URL", "http://x/?a=b")]
        );
    }

    #[test]
    fn test_deserialize_tagged() {
        let provisioners: Vec<Provisioner> = serde_json::from_str(
            r#"[
                {"type": "windows-shell", "inline": ["dir"]},
                {"type": "powershell", "inline": ["Get-Date"], "elevated": true},
                {"type": "windows-restart", "restart_timeout": "10m"}
            ]"#,
        )
        .unwrap();

        let names: Vec<&str> = provisioners.iter().map(Provisioner::name).collect();
        assert_eq!(names, vec!["windows-shell", "powershell", "windows-restart"]);
        assert!(provisioners.iter().all(|p| p.validate().is_ok()));
    }
}
