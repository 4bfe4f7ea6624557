//! Build steps that prepare a WinRM connection.
//!
//! Steps run in order against a shared [`BuildContext`]. A step that cannot
//! continue records its error in the context and halts; every step that ran
//! then gets to clean up, in reverse order.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::{future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{context::BuildContext, error::Error};

pub mod connect;
pub mod forward;
pub mod password;

pub use connect::StepConnectWinRm;
pub use forward::StepForwardWinRm;
pub use password::StepGetPassword;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    Halt,
}

#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &Arc<BuildContext>) -> StepAction;

    async fn cleanup(&self, ctx: &Arc<BuildContext>) {
        let _ = ctx;
    }
}

/// Report `error` to the user, keep it for [`run_steps`] and halt.
pub async fn halt(ctx: &BuildContext, error: anyhow::Error) -> StepAction {
    ctx.ui.error(&format!("{error:#}"));
    ctx.set_error(error).await;
    StepAction::Halt
}

/// Run steps in order until one halts or the build is cancelled.
pub async fn run_steps(steps: &[Box<dyn Step>], ctx: &Arc<BuildContext>) -> Result<()> {
    let mut ran = 0;
    let mut halted = false;

    for step in steps {
        if ctx.cancel.is_cancelled() {
            ctx.set_error(Error::cancelled(step.name()).into()).await;
            halted = true;
            break;
        }

        debug!(step = step.name(), "Running step");
        ran += 1;
        if step.run(ctx).await == StepAction::Halt {
            info!(step = step.name(), "Step halted the build");
            halted = true;
            break;
        }
    }

    for step in steps[..ran].iter().rev() {
        step.cleanup(ctx).await;
    }

    if halted {
        return Err(ctx
            .take_error()
            .await
            .unwrap_or_else(|| anyhow!("build halted")));
    }
    Ok(())
}

/// Run a polling task in the background until it finishes, `timeout`
/// elapses or the build is cancelled, whichever comes first.
///
/// The task receives a token that is cancelled when it is abandoned; it is
/// also aborted at its next suspension point.
pub async fn wait_for<T, F, Fut>(
    waiting_for: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    task: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let abandon = cancel.child_token();
    let mut handle = tokio::spawn(task(abandon.clone()));

    debug!(waiting_for, ?timeout, "Waiting in background");
    let result = tokio::select! {
        joined = &mut handle => {
            return joined.map_err(|error| anyhow!("{waiting_for} task failed: {error}"))?;
        }
        _ = tokio::time::sleep(timeout) => Error::timeout(waiting_for),
        _ = cancel.cancelled() => Error::cancelled(waiting_for),
    };

    abandon.cancel();
    handle.abort();
    Err(result.into())
}
