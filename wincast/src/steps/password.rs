use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use rsa::{
    Pkcs1v15Encrypt, RsaPrivateKey, pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{Step, StepAction, halt, wait_for};
use crate::{cloud::Ec2, context::BuildContext, error::Error};

/// Whether a PEM block holds a key that needs a passphrase.
fn is_passphrase_protected(block: &pem::Pem) -> bool {
    block.tag() == "ENCRYPTED PRIVATE KEY"
        || block.headers().get("DEK-Info").is_some()
        || block
            .headers()
            .get("Proc-Type")
            .is_some_and(|value| value.contains("ENCRYPTED"))
}

/// Decrypt the base64 password blob the cloud generated for an instance
/// with the private key of the instance's key pair.
pub fn decrypt_password_data(password_data: &str, private_key: &str) -> Result<String> {
    let block = pem::parse(private_key).context("Failed to parse private key")?;
    if is_passphrase_protected(&block) {
        return Err(Error::PassphraseProtectedKey.into());
    }

    let key = match block.tag() {
        "RSA PRIVATE KEY" => RsaPrivateKey::from_pkcs1_der(block.contents())
            .map_err(|error| anyhow!("Invalid RSA private key: {error}"))?,
        "PRIVATE KEY" => RsaPrivateKey::from_pkcs8_der(block.contents())
            .map_err(|error| anyhow!("Invalid private key: {error}"))?,
        tag => bail!("Unsupported private key type: {tag}"),
    };

    // The blob is sometimes wrapped across lines
    let data: String = password_data.split_whitespace().collect();
    let encrypted = STANDARD
        .decode(data)
        .context("Password data is not valid base64")?;

    let password = key
        .decrypt(Pkcs1v15Encrypt, &encrypted)
        .map_err(|error| anyhow!("Failed to decrypt password data: {error}"))?;
    Ok(String::from_utf8(password)?)
}

/// Waits for the cloud to generate the administrator password and makes it
/// available to the connection step.
pub struct StepGetPassword<E> {
    ec2: Arc<E>,

    /// A known password, so nothing needs to be retrieved
    password: Option<String>,
    timeout: Duration,
    interval: Duration,
}

impl<E: Ec2 + 'static> StepGetPassword<E> {
    pub fn new(ec2: E, password: Option<String>, timeout: Duration) -> Self {
        Self {
            ec2: Arc::new(ec2),
            password,
            timeout,
            interval: Duration::from_secs(20),
        }
    }

    /// Time between password requests.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll until the password is available and decrypt it.
    pub async fn password(&self, ctx: &BuildContext) -> Result<String> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }

        let instance = ctx
            .instance()
            .await
            .ok_or_else(|| anyhow!("No instance to retrieve a password for"))?;
        let private_key = ctx
            .private_key
            .clone()
            .ok_or_else(|| anyhow!("A private key is required to decrypt the password"))?;

        ctx.ui.say(&format!(
            "Retrieving auto-generated password for instance {}...",
            instance.id
        ));
        info!(instance = %instance.id, timeout = ?self.timeout, "Waiting for instance password");

        let ec2 = self.ec2.clone();
        let interval = self.interval;
        let id = instance.id.clone();
        wait_for(
            &format!("password for instance {}", instance.id),
            self.timeout,
            &ctx.cancel,
            move |abandon| async move {
                loop {
                    tokio::select! {
                        _ = abandon.cancelled() => {
                            return Err(anyhow::Error::from(Error::cancelled("password")));
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }

                    let data = match ec2.get_password_data(&id).await {
                        Ok(data) => data,
                        Err(error) => {
                            warn!(instance = %id, error = %format!("{error:#}"), "Failed to retrieve password data");
                            continue;
                        }
                    };
                    if data.trim().is_empty() {
                        debug!(instance = %id, "Password not generated yet");
                        continue;
                    }

                    return decrypt_password_data(&data, &private_key)
                        .context("Failed to decrypt auto-generated instance password");
                }
            },
        )
        .await
    }
}

#[async_trait]
impl<E: Ec2 + 'static> Step for StepGetPassword<E> {
    fn name(&self) -> &str {
        "get-password"
    }

    async fn run(&self, ctx: &Arc<BuildContext>) -> StepAction {
        match self.password(ctx).await {
            Ok(password) => {
                ctx.set_password(password).await;
                StepAction::Continue
            }
            Err(error) => halt(ctx, error).await,
        }
    }
}
