//! State shared between the steps of one build.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{cloud::Instance, communicator::Communicator, ui::Ui};

/// Everything a step may need from the steps before it. Slots start empty and
/// are filled in as the build progresses.
pub struct BuildContext {
    pub ui: Arc<dyn Ui>,

    /// Cancelled when the build is interrupted
    pub cancel: CancellationToken,

    /// Name of the virtual machine, for hypervisor backed builds
    pub vm_name: Option<String>,

    /// PEM encoded private key for decrypting generated passwords
    pub private_key: Option<String>,

    instance: Mutex<Option<Instance>>,
    forwarded_port: Mutex<Option<u16>>,
    password: Mutex<Option<String>>,
    communicator: Mutex<Option<Arc<dyn Communicator>>>,
    error: Mutex<Option<anyhow::Error>>,
}

impl BuildContext {
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self {
            ui,
            cancel: CancellationToken::new(),
            vm_name: None,
            private_key: None,
            instance: Mutex::new(None),
            forwarded_port: Mutex::new(None),
            password: Mutex::new(None),
            communicator: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn with_vm_name(mut self, vm_name: impl Into<String>) -> Self {
        self.vm_name = Some(vm_name.into());
        self
    }

    pub fn with_private_key(mut self, pem: impl Into<String>) -> Self {
        self.private_key = Some(pem.into());
        self
    }

    pub fn with_instance(mut self, instance: Instance) -> Self {
        *self.instance.get_mut() = Some(instance);
        self
    }

    /// The last known description of the cloud instance.
    pub async fn instance(&self) -> Option<Instance> {
        self.instance.lock().await.clone()
    }

    pub async fn set_instance(&self, instance: Instance) {
        *self.instance.lock().await = Some(instance);
    }

    /// Host port forwarded to the machine's WinRM listener.
    pub async fn forwarded_port(&self) -> Option<u16> {
        *self.forwarded_port.lock().await
    }

    pub async fn set_forwarded_port(&self, port: u16) {
        *self.forwarded_port.lock().await = Some(port);
    }

    /// Password discovered by an earlier step.
    pub async fn password(&self) -> Option<String> {
        self.password.lock().await.clone()
    }

    pub async fn set_password(&self, password: String) {
        *self.password.lock().await = Some(password);
    }

    /// The connected communicator, once WinRM is reachable.
    pub async fn communicator(&self) -> Option<Arc<dyn Communicator>> {
        self.communicator.lock().await.clone()
    }

    pub async fn set_communicator(&self, communicator: Arc<dyn Communicator>) {
        *self.communicator.lock().await = Some(communicator);
    }

    /// Record why a step halted the build.
    pub async fn set_error(&self, error: anyhow::Error) {
        *self.error.lock().await = Some(error);
    }

    pub async fn take_error(&self) -> Option<anyhow::Error> {
        self.error.lock().await.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{communicator::fake::FakeCommunicator, ui::recording::RecordingUi};

    #[tokio::test]
    async fn test_slots() {
        let ctx = BuildContext::new(Arc::new(RecordingUi::default())).with_vm_name("win10");

        assert_eq!(ctx.vm_name.as_deref(), Some("win10"));
        assert_eq!(ctx.forwarded_port().await, None);
        assert!(ctx.communicator().await.is_none());

        ctx.set_forwarded_port(5123).await;
        ctx.set_password(String::from("hunter2")).await;
        ctx.set_communicator(Arc::new(FakeCommunicator::default()))
            .await;

        assert_eq!(ctx.forwarded_port().await, Some(5123));
        assert_eq!(ctx.password().await.as_deref(), Some("hunter2"));
        assert!(ctx.communicator().await.is_some());
    }

    #[tokio::test]
    async fn test_error_taken_once() {
        let ctx = BuildContext::new(Arc::new(RecordingUi::default()));
        ctx.set_error(anyhow::anyhow!("boom")).await;

        assert_eq!(ctx.take_error().await.unwrap().to_string(), "boom");
        assert!(ctx.take_error().await.is_none());
    }
}
