//! Hypervisor capabilities consumed by the WinRM steps.

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Network facts about a guest, as reported by its hypervisor.
#[async_trait]
pub trait GuestNetwork: Send + Sync {
    /// MAC address of the guest's first network adapter.
    async fn mac(&self, vm: &str) -> Result<String>;

    /// IP address leased to the given MAC. Fails until the guest has network.
    async fn ip_address(&self, mac: &str) -> Result<String>;
}

/// Forwards a host port to a port inside the guest.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn forward(&self, vm: &str, host_port: u16, guest_port: u16) -> Result<()>;
}

/// Drives VirtualBox through `VBoxManage`.
#[derive(Clone, Debug)]
pub struct VBoxManage {
    pub executable: String,
}

impl Default for VBoxManage {
    fn default() -> Self {
        Self {
            executable: String::from("VBoxManage"),
        }
    }
}

impl VBoxManage {
    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(executable = %self.executable, ?args, "Running VBoxManage");
        let output = Command::new(&self.executable).args(args).output().await?;

        if !output.status.success() {
            bail!(
                "VBoxManage failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// The NAT rule VirtualBox is given for WinRM.
fn natpf_rule(host_port: u16, guest_port: u16) -> String {
    format!("wincastwinrm,tcp,127.0.0.1,{host_port},,{guest_port}")
}

#[async_trait]
impl PortForwarder for VBoxManage {
    async fn forward(&self, vm: &str, host_port: u16, guest_port: u16) -> Result<()> {
        self.run(&[
            String::from("modifyvm"),
            vm.to_string(),
            String::from("--natpf1"),
            natpf_rule(host_port, guest_port),
        ])
        .await?;
        Ok(())
    }
}
