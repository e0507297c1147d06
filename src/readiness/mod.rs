pub mod probes;
pub mod services;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::error::HarnessError;
use crate::retry::{BackoffPolicy, ConditionPoller, PollOutcome};

// Re-export commonly used types
pub use probes::{GatewayStatusProbe, HttpLivenessProbe, LivenessProbe};
pub use services::{classify, ComposeStack, ServiceStack, ServiceState, ServiceStatus};

const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Confirms that the container stack and every liveness endpoint are healthy
/// at the same time.
pub struct ServiceReadinessProber {
    stack: Arc<dyn ServiceStack>,
    probes: Vec<Arc<dyn LivenessProbe>>,
    attempt_timeout: Duration,
}

impl ServiceReadinessProber {
    pub fn new(stack: Arc<dyn ServiceStack>) -> Self {
        Self {
            stack,
            probes: Vec::new(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn probe_names(&self) -> Vec<&str> {
        self.probes.iter().map(|probe| probe.name()).collect()
    }

    /// Waits until `services` are all running and every probe answers.
    ///
    /// Each check polls on its own under `policy`; they run concurrently and
    /// the first fatal error or timeout drops the others.
    pub async fn wait_ready(
        &self,
        services: &[String],
        policy: &BackoffPolicy,
    ) -> Result<Vec<ServiceStatus>, HarnessError> {
        info!(
            "Waiting for services [{}] and {} liveness probe(s)",
            services.join(", "),
            self.probes.len()
        );

        let mut checks: Vec<BoxFuture<'_, Result<Option<Vec<ServiceStatus>>, HarnessError>>> =
            Vec::with_capacity(self.probes.len() + 1);

        checks.push(
            self.wait_for_containers(services, policy)
                .map(|result| result.map(Some))
                .boxed(),
        );

        for probe in &self.probes {
            checks.push(
                self.wait_for_probe(probe.clone(), policy)
                    .map(|result| result.map(|_| None))
                    .boxed(),
            );
        }

        let results = try_join_all(checks).await?;
        info!("All services are ready");

        Ok(results.into_iter().flatten().flatten().collect())
    }

    /// Polls container states only.
    pub async fn wait_for_containers(
        &self,
        services: &[String],
        policy: &BackoffPolicy,
    ) -> Result<Vec<ServiceStatus>, HarnessError> {
        let stack = &self.stack;
        let statuses = ConditionPoller::new("containers", policy)
            .with_attempt_timeout(self.attempt_timeout)
            .poll(|| async move {
                match stack.list_statuses().await {
                    Ok(statuses) => classify(&statuses, services),
                    Err(e @ HarnessError::Serialization(_)) => PollOutcome::Fatal(
                        HarnessError::fatal("containers", format!("malformed status output: {e}")),
                    ),
                    // The stack CLI itself may fail while the daemon settles.
                    Err(e) => PollOutcome::retryable(format!("listing services failed: {e}")),
                }
            })
            .await?;

        Ok(statuses)
    }

    async fn wait_for_probe(
        &self,
        probe: Arc<dyn LivenessProbe>,
        policy: &BackoffPolicy,
    ) -> Result<(), HarnessError> {
        let label = probe.name().to_string();
        ConditionPoller::new(label, policy)
            .with_attempt_timeout(self.attempt_timeout)
            .poll(|| {
                let probe = probe.clone();
                async move { probe.check().await }
            })
            .await?;
        Ok(())
    }
}
