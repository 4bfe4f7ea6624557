//! Finding where a machine's WinRM listener can be reached.
//!
//! Resolution runs again on every connection attempt since a booting machine
//! may not have an address yet, or may get a different one.

use anyhow::Result;
use async_trait::async_trait;
use std::{fmt::Display, sync::Arc};
use tracing::{debug, info};

use crate::{
    cloud::{Ec2, Instance},
    context::BuildContext,
    driver::GuestNetwork,
    error::Error,
};

/// A resolved WinRM address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[async_trait]
pub trait ResolveEndpoint: Send + Sync {
    /// Find the current address. Errors are expected while the machine boots
    /// and callers retry them.
    async fn resolve(&self, ctx: &BuildContext) -> Result<Address>;
}

pub enum EndpointResolver {
    /// A fixed host. A port forwarded by an earlier step replaces the
    /// configured port.
    Static { host: String, port: u16 },

    /// Ask the hypervisor which address the guest was given, unless a host
    /// is configured.
    Guest {
        host: Option<String>,
        port: u16,
        network: Arc<dyn GuestNetwork>,
    },

    /// Read the address from the cloud's description of the instance.
    Cloud {
        ec2: Arc<dyn Ec2>,
        port: u16,

        /// Only ever connect to the private address
        private: bool,
    },
}

impl EndpointResolver {
    pub fn localhost(port: u16) -> Self {
        Self::Static {
            host: String::from("127.0.0.1"),
            port,
        }
    }
}

fn first<'a>(candidates: &[&'a String]) -> Option<&'a str> {
    candidates
        .iter()
        .find(|candidate| !candidate.is_empty())
        .map(|candidate| candidate.as_str())
}

/// Pick an address from an instance description, if it has one yet.
fn instance_host(instance: &Instance, private: bool) -> Option<&str> {
    if private {
        return first(&[&instance.private_ip, &instance.private_dns]);
    }

    let host = first(&[&instance.public_dns, &instance.public_ip]);
    if host.is_none() && !instance.vpc_id.is_empty() {
        return first(&[&instance.private_ip]);
    }
    host
}

#[async_trait]
impl ResolveEndpoint for EndpointResolver {
    async fn resolve(&self, ctx: &BuildContext) -> Result<Address> {
        match self {
            EndpointResolver::Static { host, port } => Ok(Address {
                host: host.clone(),
                port: ctx.forwarded_port().await.unwrap_or(*port),
            }),
            EndpointResolver::Guest {
                host,
                port,
                network,
            } => {
                let port = ctx.forwarded_port().await.unwrap_or(*port);
                if let Some(host) = host {
                    return Ok(Address {
                        host: host.clone(),
                        port,
                    });
                }

                let vm = ctx.vm_name.as_deref().ok_or_else(|| Error::NoAddress {
                    resource: String::from("unnamed virtual machine"),
                })?;
                let mac = network.mac(vm).await?;
                let host = network.ip_address(&mac).await?;
                debug!(vm, mac, host, "Resolved guest address");
                Ok(Address { host, port })
            }
            EndpointResolver::Cloud { ec2, port, private } => {
                let Some(instance) = ctx.instance().await else {
                    return Err(Error::NoAddress {
                        resource: String::from("unknown instance"),
                    }
                    .into());
                };

                if let Some(host) = instance_host(&instance, *private) {
                    info!(instance = %instance.id, host, port, "Resolved instance address");
                    return Ok(Address {
                        host: host.to_string(),
                        port: *port,
                    });
                }

                // Refresh the description so the next attempt sees any newly
                // assigned address
                let fresh = ec2.describe_instance(&instance.id).await?;
                ctx.set_instance(fresh).await;
                Err(Error::NoAddress {
                    resource: instance.id,
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::recording::RecordingUi;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeEc2 {
        described: Mutex<usize>,
        next: Instance,
    }

    #[async_trait]
    impl Ec2 for FakeEc2 {
        async fn describe_instance(&self, _id: &str) -> Result<Instance> {
            *self.described.lock().unwrap() += 1;
            Ok(self.next.clone())
        }

        async fn get_password_data(&self, _id: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    struct FakeNetwork;

    #[async_trait]
    impl GuestNetwork for FakeNetwork {
        async fn mac(&self, vm: &str) -> Result<String> {
            assert_eq!(vm, "win10");
            Ok(String::from("08:00:27:aa:bb:cc"))
        }

        async fn ip_address(&self, mac: &str) -> Result<String> {
            assert_eq!(mac, "08:00:27:aa:bb:cc");
            Ok(String::from("192.168.56.10"))
        }
    }

    fn ctx() -> BuildContext {
        BuildContext::new(Arc::new(RecordingUi::default()))
    }

    fn booted() -> Instance {
        Instance {
            id: String::from("i-0123"),
            public_ip: String::from("54.1.2.3"),
            private_ip: String::from("10.0.0.5"),
            private_dns: String::from("ip-10-0-0-5.ec2.internal"),
            vpc_id: String::from("vpc-1"),
            ..Instance::default()
        }
    }

    #[tokio::test]
    async fn test_static_prefers_forwarded_port() {
        let ctx = ctx();
        let resolver = EndpointResolver::localhost(5985);
        assert_eq!(
            resolver.resolve(&ctx).await.unwrap().to_string(),
            "127.0.0.1:5985"
        );

        ctx.set_forwarded_port(5123).await;
        assert_eq!(
            resolver.resolve(&ctx).await.unwrap().to_string(),
            "127.0.0.1:5123"
        );
    }

    #[tokio::test]
    async fn test_guest_lookup() {
        let ctx = ctx().with_vm_name("win10");
        let resolver = EndpointResolver::Guest {
            host: None,
            port: 5985,
            network: Arc::new(FakeNetwork),
        };
        assert_eq!(
            resolver.resolve(&ctx).await.unwrap().to_string(),
            "192.168.56.10:5985"
        );

        let resolver = EndpointResolver::Guest {
            host: Some(String::from("win.local")),
            port: 5986,
            network: Arc::new(FakeNetwork),
        };
        assert_eq!(
            resolver.resolve(&ctx).await.unwrap().to_string(),
            "win.local:5986"
        );
    }

    #[tokio::test]
    async fn test_cloud_public_ip() {
        let ctx = ctx().with_instance(booted());
        let resolver = EndpointResolver::Cloud {
            ec2: Arc::new(FakeEc2::default()),
            port: 5985,
            private: false,
        };
        assert_eq!(
            resolver.resolve(&ctx).await.unwrap().to_string(),
            "54.1.2.3:5985"
        );
    }

    #[tokio::test]
    async fn test_cloud_private_wins() {
        let ctx = ctx().with_instance(Instance {
            public_dns: String::from("ec2-54-1-2-3.compute.amazonaws.com"),
            ..booted()
        });
        let resolver = EndpointResolver::Cloud {
            ec2: Arc::new(FakeEc2::default()),
            port: 5985,
            private: true,
        };
        assert_eq!(
            resolver.resolve(&ctx).await.unwrap().to_string(),
            "10.0.0.5:5985"
        );
    }

    #[tokio::test]
    async fn test_cloud_refreshes_empty_instance() {
        let ctx = ctx().with_instance(Instance {
            id: String::from("i-0123"),
            ..Instance::default()
        });
        let ec2 = Arc::new(FakeEc2 {
            next: booted(),
            ..FakeEc2::default()
        });
        let resolver = EndpointResolver::Cloud {
            ec2: ec2.clone(),
            port: 5985,
            private: false,
        };

        let error = resolver.resolve(&ctx).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::NoAddress { .. })
        ));
        assert_eq!(*ec2.described.lock().unwrap(), 1);
        assert_eq!(ctx.instance().await, Some(booted()));

        // The next attempt sees the refreshed description
        assert_eq!(
            resolver.resolve(&ctx).await.unwrap().to_string(),
            "54.1.2.3:5985"
        );
    }

    #[test]
    fn test_instance_host() {
        let classic = Instance {
            private_ip: String::from("10.0.0.5"),
            ..Instance::default()
        };
        assert_eq!(instance_host(&classic, false), None);
        assert_eq!(instance_host(&classic, true), Some("10.0.0.5"));

        let vpc = Instance {
            vpc_id: String::from("vpc-1"),
            ..classic
        };
        assert_eq!(instance_host(&vpc, false), Some("10.0.0.5"));
    }
}
