use anyhow::{Context, Result, anyhow};
use std::{path::Path, process::ExitCode, sync::Arc};
use tracing::{debug, error, info};

use super::Connection;
use crate::{
    communicator::{WinRmConnector, winrm::ConnectOptions},
    config::{ConfigPath, Template},
    context::BuildContext,
    error::Error,
    resolver::EndpointResolver,
    steps::{Step, StepConnectWinRm, run_steps},
    ui::{ConsoleUi, Ui},
};

/// Connect to the machine described by the template and run every
/// provisioner in order.
pub async fn provision(
    ctx: &Arc<BuildContext>,
    connection: &Connection,
    template: &Template,
) -> Result<()> {
    // Flags fill in what the template leaves out
    let host = template
        .winrm
        .host
        .clone()
        .unwrap_or_else(|| connection.host.clone());
    if let Some(password) = &connection.password {
        ctx.set_password(password.clone()).await;
    }

    let resolver = EndpointResolver::Static {
        host,
        port: template.winrm.port,
    };
    let connector = WinRmConnector {
        options: ConnectOptions::from_config(&template.winrm, &template.http),
    };
    let steps: Vec<Box<dyn Step>> = vec![Box::new(StepConnectWinRm::new(
        resolver,
        connector,
        &template.winrm,
    ))];
    run_steps(&steps, ctx).await?;

    let comm = ctx
        .communicator()
        .await
        .ok_or_else(|| anyhow!("No communicator after connecting"))?;

    for provisioner in &template.provisioners {
        if ctx.cancel.is_cancelled() {
            return Err(Error::cancelled(provisioner.name()).into());
        }

        info!(provisioner = provisioner.name(), "Running provisioner");
        provisioner
            .provision(ctx, &comm)
            .await
            .with_context(|| format!("Provisioner {} failed", provisioner.name()))?;
    }
    Ok(())
}

pub fn run(connection: &Connection, path: &Path) -> ExitCode {
    let config_path = match ConfigPath::from_dir(path) {
        Some(p) => {
            debug!("Loading config from {}", p);
            p
        }
        _ => {
            error!("Failed to find config file");
            return ExitCode::FAILURE;
        }
    };

    let template = match config_path.load() {
        Ok(template) => {
            debug!("Loaded: {:#?}", &template);
            template
        }
        Err(error) => {
            error!(error = ?error, "Failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match super::runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(error = ?error, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let ui: Arc<dyn Ui> = Arc::new(ConsoleUi);
    let ctx = Arc::new(BuildContext::new(ui));
    let result = runtime.block_on(async {
        super::cancel_on_ctrl_c(ctx.cancel.clone());
        provision(&ctx, connection, &template).await
    });

    match result {
        Ok(()) => {
            ctx.ui.say("Provisioning finished");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = ?error, "Failed to provision");
            ExitCode::FAILURE
        }
    }
}
