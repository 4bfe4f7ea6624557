//! The slice of the EC2 API the WinRM steps need. Launching and terminating
//! instances belongs to the host; it hands over an [`Ec2`] implementation and
//! the instance it launched.

use anyhow::Result;
use async_trait::async_trait;

/// What we know about a launched instance. Address fields are empty until the
/// cloud assigns them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub public_dns: String,
    pub private_dns: String,
    pub public_ip: String,
    pub private_ip: String,
    pub vpc_id: String,
}

#[async_trait]
pub trait Ec2: Send + Sync {
    /// Fetch a fresh description of the instance.
    async fn describe_instance(&self, id: &str) -> Result<Instance>;

    /// The base64 encoded, encrypted administrator password. Empty until
    /// Windows has generated it.
    async fn get_password_data(&self, id: &str) -> Result<String>;
}
