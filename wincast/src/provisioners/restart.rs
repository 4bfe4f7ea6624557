use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};
use validator::{Validate, ValidationError};

use super::{default_retry_sleep, retryable, start_with_ui};
use crate::{communicator::Communicator, context::BuildContext, error::Error, steps::wait_for};

fn default_restart_command() -> String {
    String::from(r#"shutdown /r /c "wincast restart" /t 5 && net stop winrm"#)
}

fn default_restart_check_command() -> String {
    wincast_wsman::powershell::command(r#"echo "${env:COMPUTERNAME} restarted.""#)
}

fn default_restart_timeout() -> Duration {
    super::default_start_retry_timeout()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(5)
}

fn positive(duration: &Duration) -> Result<(), ValidationError> {
    if duration.is_zero() {
        return Err(ValidationError::new("positive_duration"));
    }
    Ok(())
}

/// Restarts the machine and waits until it accepts commands again.
#[derive(Clone, Serialize, Deserialize, Validate, Debug)]
pub struct WindowsRestart {
    #[serde(default = "default_restart_command")]
    #[validate(length(min = 1))]
    pub restart_command: String,

    /// Succeeds once the machine is back
    #[serde(default = "default_restart_check_command")]
    #[validate(length(min = 1))]
    pub restart_check_command: String,

    /// How long the machine may take to come back. Also bounds retries of
    /// the restart command itself.
    #[serde(default = "default_restart_timeout", with = "humantime_serde")]
    #[validate(custom(function = "positive"))]
    pub restart_timeout: Duration,

    #[serde(default = "default_check_interval", with = "humantime_serde")]
    #[validate(custom(function = "positive"))]
    pub check_interval: Duration,

    #[serde(skip, default = "default_retry_sleep")]
    pub retry_sleep: Duration,
}

impl Default for WindowsRestart {
    fn default() -> Self {
        Self {
            restart_command: default_restart_command(),
            restart_check_command: default_restart_check_command(),
            restart_timeout: default_restart_timeout(),
            check_interval: default_check_interval(),
            retry_sleep: default_retry_sleep(),
        }
    }
}

impl WindowsRestart {
    pub async fn provision(
        &self,
        ctx: &Arc<BuildContext>,
        comm: &Arc<dyn Communicator>,
    ) -> Result<()> {
        ctx.ui.say("Restarting Machine");

        let command = self.restart_command.as_str();
        let ui = &ctx.ui;
        let cmd = retryable(self.restart_timeout, self.retry_sleep, || {
            start_with_ui(comm.as_ref(), ui, command, false)
        })
        .await?;

        let exit_status = cmd.wait().await;
        if exit_status != 0 {
            bail!("Restart script exited with non-zero exit status: {exit_status}");
        }

        ctx.ui.say("Waiting for machine to restart...");
        self.wait_for_restart(ctx, comm).await?;

        ctx.ui.say("Machine successfully restarted, moving on");
        Ok(())
    }

    async fn wait_for_restart(
        &self,
        ctx: &Arc<BuildContext>,
        comm: &Arc<dyn Communicator>,
    ) -> Result<()> {
        let comm = comm.clone();
        let ui = ctx.ui.clone();
        let check = self.restart_check_command.clone();
        let interval = self.check_interval;

        info!(timeout = ?self.restart_timeout, "Waiting for machine to restart");
        wait_for("restart", self.restart_timeout, &ctx.cancel, move |abandon| async move {
            loop {
                tokio::select! {
                    _ = abandon.cancelled() => return Err(anyhow::Error::from(Error::cancelled("restart"))),
                    _ = tokio::time::sleep(interval) => {}
                }

                match start_with_ui(comm.as_ref(), &ui, &check, false).await {
                    Ok(cmd) => match cmd.wait().await {
                        0 => return Ok(()),
                        exit_status => debug!(exit_status, "Machine not back yet"),
                    },
                    Err(error) => debug!(error = %format!("{error:#}"), "Machine not reachable yet"),
                }
            }
        })
        .await
    }
}
