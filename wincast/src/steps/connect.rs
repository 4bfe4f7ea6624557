use anyhow::Result;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{Step, StepAction, halt, wait_for};
use crate::{
    communicator::Communicator,
    config::WinRmConfig,
    context::BuildContext,
    error::Error,
    resolver::{Address, ResolveEndpoint},
};

/// Opens a communicator once an address is known.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(
        &self,
        address: &Address,
        user: &str,
        password: &str,
    ) -> Result<Arc<dyn Communicator>>;
}

/// Waits for WinRM to accept connections and publishes the communicator.
///
/// Any failure to resolve or connect is assumed to be the machine still
/// booting and is retried until the wait timeout.
pub struct StepConnectWinRm<R, C> {
    resolver: Arc<R>,
    connector: Arc<C>,
    user: String,
    password: Option<String>,
    timeout: Duration,
    interval: Duration,
}

impl<R, C> StepConnectWinRm<R, C>
where
    R: ResolveEndpoint + 'static,
    C: Connect + 'static,
{
    pub fn new(resolver: R, connector: C, config: &WinRmConfig) -> Self {
        Self {
            resolver: Arc::new(resolver),
            connector: Arc::new(connector),
            user: config.username.clone(),
            password: config.password.clone(),
            timeout: config.wait_timeout,
            interval: Duration::from_secs(5),
        }
    }

    /// Time between connection attempts.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll until a communicator is connected.
    pub async fn connect(&self, ctx: &Arc<BuildContext>) -> Result<Arc<dyn Communicator>> {
        // A password found by an earlier step wins over the configured one
        let password = match ctx.password().await {
            Some(password) => password,
            None => self.password.clone().unwrap_or_default(),
        };

        let resolver = self.resolver.clone();
        let connector = self.connector.clone();
        let user = self.user.clone();
        let interval = self.interval;
        let task_ctx = ctx.clone();

        info!(timeout = ?self.timeout, "Waiting for WinRM");
        wait_for("WinRM", self.timeout, &ctx.cancel, move |abandon| async move {
            let mut attempt = 0;
            loop {
                tokio::select! {
                    _ = abandon.cancelled() => return Err(anyhow::Error::from(Error::cancelled("WinRM"))),
                    _ = tokio::time::sleep(interval) => {}
                }
                attempt += 1;

                let address = match resolver.resolve(&task_ctx).await {
                    Ok(address) => address,
                    Err(error) => {
                        debug!(attempt, error = %error, "WinRM address not available yet");
                        continue;
                    }
                };

                debug!(attempt, %address, "Attempting WinRM connection");
                match connector.connect(&address, &user, &password).await {
                    Ok(communicator) => return Ok(communicator),
                    Err(error) => {
                        warn!(attempt, %address, error = %format!("{error:#}"), "WinRM connection failed");
                    }
                }
            }
        })
        .await
    }
}

#[async_trait]
impl<R, C> Step for StepConnectWinRm<R, C>
where
    R: ResolveEndpoint + 'static,
    C: Connect + 'static,
{
    fn name(&self) -> &str {
        "connect-winrm"
    }

    async fn run(&self, ctx: &Arc<BuildContext>) -> StepAction {
        ctx.ui.say("Waiting for WinRM to become available...");

        match self.connect(ctx).await {
            Ok(communicator) => {
                ctx.ui.say("Connected to WinRM!");
                ctx.set_communicator(communicator).await;
                StepAction::Continue
            }
            Err(error) => halt(ctx, error).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{communicator::fake::FakeCommunicator, ui::recording::RecordingUi};
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Instant,
    };

    /// Fails until it has been called `ready_after` times.
    struct FlakyResolver {
        calls: Arc<AtomicUsize>,
        ready_after: usize,
    }

    #[async_trait]
    impl ResolveEndpoint for FlakyResolver {
        async fn resolve(&self, _ctx: &BuildContext) -> Result<Address> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.ready_after {
                anyhow::bail!("no address yet");
            }
            Ok(Address {
                host: String::from("10.0.0.5"),
                port: 5985,
            })
        }
    }

    #[derive(Default)]
    struct RecordingConnector {
        attempts: Arc<Mutex<Vec<(String, String, String)>>>,
    }

    #[async_trait]
    impl Connect for RecordingConnector {
        async fn connect(
            &self,
            address: &Address,
            user: &str,
            password: &str,
        ) -> Result<Arc<dyn Communicator>> {
            self.attempts.lock().unwrap().push((
                address.to_string(),
                user.to_string(),
                password.to_string(),
            ));
            Ok(Arc::new(FakeCommunicator::default()))
        }
    }

    fn config(timeout: Duration) -> WinRmConfig {
        WinRmConfig {
            username: String::from("Administrator"),
            password: Some(String::from("configured")),
            wait_timeout: timeout,
            ..WinRmConfig::default()
        }
    }

    fn ctx() -> Arc<BuildContext> {
        Arc::new(BuildContext::new(Arc::new(RecordingUi::default())))
    }

    #[test_log::test(tokio::test)]
    async fn test_times_out_when_never_resolvable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = StepConnectWinRm::new(
            FlakyResolver {
                calls: calls.clone(),
                ready_after: usize::MAX,
            },
            RecordingConnector::default(),
            &config(Duration::from_millis(50)),
        )
        .with_interval(Duration::from_millis(5));

        let started = Instant::now();
        let error = step.connect(&ctx()).await.err().expect("expected connect to fail");
        let elapsed = started.elapsed();

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Timeout { .. })
        ));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
        assert!(calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_connects_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = RecordingConnector::default();
        let attempts = connector.attempts.clone();
        let step = StepConnectWinRm::new(
            FlakyResolver {
                calls: calls.clone(),
                ready_after: 3,
            },
            connector,
            &config(Duration::from_secs(10)),
        )
        .with_interval(Duration::from_millis(1));

        let ctx = ctx();
        assert_eq!(step.run(&ctx).await, StepAction::Continue);

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(ctx.communicator().await.is_some());
        assert_eq!(
            *attempts.lock().unwrap(),
            vec![(
                String::from("10.0.0.5:5985"),
                String::from("Administrator"),
                String::from("configured")
            )]
        );
    }

    #[tokio::test]
    async fn test_discovered_password_wins() {
        let connector = RecordingConnector::default();
        let attempts = connector.attempts.clone();
        let step = StepConnectWinRm::new(
            FlakyResolver {
                calls: Arc::new(AtomicUsize::new(0)),
                ready_after: 1,
            },
            connector,
            &config(Duration::from_secs(10)),
        )
        .with_interval(Duration::from_millis(1));

        let ctx = ctx();
        ctx.set_password(String::from("generated")).await;
        step.connect(&ctx).await.unwrap();

        assert_eq!(attempts.lock().unwrap()[0].2, "generated");
    }

    #[tokio::test]
    async fn test_cancelled_mid_poll() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = StepConnectWinRm::new(
            FlakyResolver {
                calls: calls.clone(),
                ready_after: usize::MAX,
            },
            RecordingConnector::default(),
            &config(Duration::from_secs(60)),
        )
        .with_interval(Duration::from_millis(10));

        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        assert_eq!(step.run(&ctx).await, StepAction::Halt);
        assert!(started.elapsed() < Duration::from_secs(1));

        let error = ctx.take_error().await.unwrap();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Cancelled { .. })
        ));
        assert!(ctx.communicator().await.is_none());

        // No further attempts once cancelled
        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }
}
