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
    String::from("c:/Windows/Temp/script.bat")
}

fn default_execute_command() -> String {
    String::from(r#"{vars}"{path}""#)
}

fn check_shell(shell: &WindowsShell) -> Result<(), ValidationError> {
    check_sources(&shell.inline, &shell.scripts)
}

/// Runs batch commands with `cmd`.
#[derive(Clone, Serialize, Deserialize, Validate, Debug)]
#[validate(schema(function = "check_shell"))]
pub struct WindowsShell {
    /// Commands joined into a single script
    #[serde(default)]
    pub inline: Vec<String>,

    /// Local script files, run in order
    #[serde(default)]
    pub scripts: Vec<PathBuf>,

    /// `KEY=VALUE` pairs set before each script runs
    #[serde(default)]
    #[validate(custom(function = "check_environment"))]
    pub environment_vars: Vec<String>,

    #[serde(default = "default_remote_path")]
    #[validate(length(min = 1))]
    pub remote_path: String,

    /// `{vars}` and `{path}` are replaced with the variable assignments and
    /// the uploaded script
    #[serde(default = "default_execute_command")]
    pub execute_command: String,

    #[serde(default = "default_start_retry_timeout", with = "humantime_serde")]
    pub start_retry_timeout: Duration,

    #[serde(skip, default = "default_retry_sleep")]
    pub retry_sleep: Duration,
}

impl Default for WindowsShell {
    fn default() -> Self {
        Self {
            inline: Vec::new(),
            scripts: Vec::new(),
            environment_vars: Vec::new(),
            remote_path: default_remote_path(),
            execute_command: default_execute_command(),
            start_retry_timeout: default_start_retry_timeout(),
            retry_sleep: default_retry_sleep(),
        }
    }
}

impl WindowsShell {
    fn flattened_vars(&self) -> String {
        environment(&self.environment_vars)
            .map(|(key, value)| format!(r#"set "{key}={value}" && "#))
            .collect()
    }

    /// The command that runs the uploaded script.
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
        ctx.ui.say("Provisioning with windows-shell...");

        let runner = ScriptRunner {
            remote_path: &self.remote_path,
            command: self.command(),
            elevated: false,
            start_retry_timeout: self.start_retry_timeout,
            retry_sleep: self.retry_sleep,
        };
        for script in collect_scripts(&self.inline, &self.scripts).await? {
            runner.run(ctx, comm, script).await?;
        }
        Ok(())
    }
}
