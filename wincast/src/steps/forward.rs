use async_trait::async_trait;
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};
use tracing::info;

use super::{Step, StepAction, halt};
use crate::{config::ForwardConfig, context::BuildContext, driver::PortForwarder};

/// Forwards a free host port to the guest's WinRM listener so the static
/// resolver can reach it on localhost.
pub struct StepForwardWinRm<F> {
    forwarder: F,
    guest_port: u16,
    host_port_min: u16,
    host_port_max: u16,
}

impl<F: PortForwarder> StepForwardWinRm<F> {
    pub fn new(forwarder: F, guest_port: u16, config: &ForwardConfig) -> Self {
        Self {
            forwarder,
            guest_port,
            host_port_min: config.host_port_min,
            host_port_max: config.host_port_max,
        }
    }

    async fn forward(&self, ctx: &BuildContext) -> anyhow::Result<u16> {
        let vm = ctx
            .vm_name
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No virtual machine to forward WinRM to"))?;

        info!(
            lower = self.host_port_min,
            upper = self.host_port_max,
            "Looking for an available WinRM port"
        );
        let host_port = crate::find_open_port(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.host_port_min,
            self.host_port_max,
        )?;

        ctx.ui.say(&format!(
            "Creating forwarded port mapping for WinRM (host port {host_port})"
        ));
        self.forwarder
            .forward(vm, host_port, self.guest_port)
            .await
            .map_err(|error| error.context("Failed to create port forwarding rule"))?;
        Ok(host_port)
    }
}

#[async_trait]
impl<F: PortForwarder> Step for StepForwardWinRm<F> {
    fn name(&self) -> &str {
        "forward-winrm"
    }

    async fn run(&self, ctx: &Arc<BuildContext>) -> StepAction {
        match self.forward(ctx).await {
            Ok(port) => {
                ctx.set_forwarded_port(port).await;
                StepAction::Continue
            }
            Err(error) => halt(ctx, error).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::recording::RecordingUi;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingForwarder {
        rules: Mutex<Vec<(String, u16, u16)>>,
        fail: bool,
    }

    #[async_trait]
    impl PortForwarder for RecordingForwarder {
        async fn forward(&self, vm: &str, host_port: u16, guest_port: u16) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("VBoxManage failed");
            }
            self.rules
                .lock()
                .unwrap()
                .push((vm.to_string(), host_port, guest_port));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_forward() {
        let ui = Arc::new(RecordingUi::default());
        let ctx = Arc::new(BuildContext::new(ui.clone()).with_vm_name("win10"));
        let step = StepForwardWinRm::new(
            RecordingForwarder::default(),
            5985,
            &ForwardConfig::default(),
        );

        assert_eq!(step.run(&ctx).await, StepAction::Continue);

        let port = ctx.forwarded_port().await.unwrap();
        assert!((4985..6985).contains(&port));
        assert_eq!(
            *step.forwarder.rules.lock().unwrap(),
            vec![(String::from("win10"), port, 5985)]
        );
        assert_eq!(ui.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_forward_failure_halts() {
        let ctx = Arc::new(BuildContext::new(Arc::new(RecordingUi::default())).with_vm_name("win10"));
        let step = StepForwardWinRm::new(
            RecordingForwarder {
                fail: true,
                ..RecordingForwarder::default()
            },
            5985,
            &ForwardConfig::default(),
        );

        assert_eq!(step.run(&ctx).await, StepAction::Halt);
        assert_eq!(ctx.forwarded_port().await, None);
        let error = ctx.take_error().await.unwrap();
        assert!(format!("{error:#}").contains("VBoxManage failed"));
    }
}
