use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Duration};
use validator::{Validate, ValidationError};

use super::{
    ScriptRunner, check_environment, check_sources, collect_scripts, default_retry_sleep,
    default_start_retry_timeout, environment,
};
use crate::{
    communicator::{Communicator, transfer::win_path},
    context::BuildContext,
};

fn default_remote_path() -> String {
    String::from("c:/Windows/Temp/script.ps1")
}

fn default_execute_command() -> String {
    String::from(r#"powershell "& { {vars}{path}; exit $LastExitCode }""#)
}

fn check_powershell(powershell: &Powershell) -> Result<(), ValidationError> {
    check_sources(&powershell.inline, &powershell.scripts)
}

/// Runs PowerShell scripts, optionally with full administrative rights.
#[derive(Clone, Serialize, Deserialize, Validate, Debug)]
#[validate(schema(function = "check_powershell"))]
pub struct Powershell {
    #[serde(default)]
    pub inline: Vec<String>,

    #[serde(default)]
    pub scripts: Vec<PathBuf>,

    #[serde(default)]
    #[validate(custom(function = "check_environment"))]
    pub environment_vars: Vec<String>,

    #[serde(default = "default_remote_path")]
    #[validate(length(min = 1))]
    pub remote_path: String,

    #[serde(default = "default_execute_command")]
    pub execute_command: String,

    /// Run through the task scheduler instead of the WinRM session
    #[serde(default)]
    pub elevated: bool,

    #[serde(default = "default_start_retry_timeout", with = "humantime_serde")]
    pub start_retry_timeout: Duration,

    #[serde(skip, default = "default_retry_sleep")]
    pub retry_sleep: Duration,
}

impl Default for Powershell {
    fn default() -> Self {
        Self {
            inline: Vec::new(),
            scripts: Vec::new(),
            environment_vars: Vec::new(),
            remote_path: default_remote_path(),
            execute_command: default_execute_command(),
            elevated: false,
            start_retry_timeout: default_start_retry_timeout(),
            retry_sleep: default_retry_sleep(),
        }
    }
}

impl Powershell {
    fn flattened_vars(&self) -> String {
        environment(&self.environment_vars)
            .map(|(key, value)| format!(r#"$env:{key}="{value}"; "#))
            .collect()
    }

    pub fn command(&self) -> String {
        self.execute_command
            .replace("{vars}", &self.flattened_vars())
            .replace("{path}", &win_path(&self.remote_path))
    }

    pub async fn provision(
        &self,
        ctx: &Arc<BuildContext>,
        comm: &Arc<dyn Communicator>,
    ) -> Result<()> {
        ctx.ui.say("Provisioning with powershell...");

        let runner = ScriptRunner {
            remote_path: &self.remote_path,
            command: self.command(),
            elevated: self.elevated,
            start_retry_timeout: self.start_retry_timeout,
            retry_sleep: self.retry_sleep,
        };
        for script in collect_scripts(&self.inline, &self.scripts).await? {
            runner.run(ctx, comm, script).await?;
        }
        Ok(())
    }
}
