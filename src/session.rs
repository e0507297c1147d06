use deadpool_postgres::Pool;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::checkpoint::CheckpointWaiter;
use crate::error::HarnessError;
use crate::readiness::{
    ComposeStack, GatewayStatusProbe, HttpLivenessProbe, ServiceReadinessProber, ServiceStack,
};
use crate::retry::{ConditionPoller, PollOutcome};
use crate::settings::HarnessSettings;
use crate::storage::{create_pool, run_migrations, PgCheckpointStore, DEFAULT_POOL_SIZE};
use crate::worker::WorkerSupervisor;

static SHARED: OnceCell<HarnessSession> = OnceCell::const_new();

/// Session-wide state: a ready service stack and a migrated store.
///
/// Built once, then passed explicitly to whatever needs it.
pub struct HarnessSession {
    settings: HarnessSettings,
    stack: Arc<dyn ServiceStack>,
    store: PgCheckpointStore,
    torn_down: AtomicBool,
}

impl HarnessSession {
    /// Starts the compose stack described by `settings` and waits for it.
    pub async fn start(settings: HarnessSettings) -> Result<Self, HarnessError> {
        let stack = Arc::new(ComposeStack::new(
            settings.compose.file.clone(),
            settings.compose.project.clone(),
        ));
        Self::start_with_stack(settings, stack).await
    }

    pub async fn start_with_stack(
        settings: HarnessSettings,
        stack: Arc<dyn ServiceStack>,
    ) -> Result<Self, HarnessError> {
        info!("Starting harness session");
        stack.bring_up().await?;

        if let Err(e) = Self::wait_ready(&settings, stack.clone()).await {
            error!("Services did not become ready: {e}");
            Self::release_stack(&settings, stack.as_ref()).await;
            return Err(e);
        }

        let pool = match Self::prepare_storage(&settings).await {
            Ok(pool) => pool,
            Err(e) => {
                error!("Storage could not be prepared: {e}");
                Self::release_stack(&settings, stack.as_ref()).await;
                return Err(e);
            }
        };

        info!("Harness session ready");
        Ok(Self {
            settings,
            stack,
            store: PgCheckpointStore::new(pool),
            torn_down: AtomicBool::new(false),
        })
    }

    /// One process-wide session, started on first use from
    /// [`HarnessSettings::new`].
    pub async fn shared() -> Result<&'static HarnessSession, HarnessError> {
        SHARED
            .get_or_try_init(|| async {
                let settings = HarnessSettings::new()?;
                Self::start(settings).await
            })
            .await
    }

    pub fn prober(
        settings: &HarnessSettings,
        stack: Arc<dyn ServiceStack>,
    ) -> Result<ServiceReadinessProber, HarnessError> {
        let attempt_timeout = settings.backoff.attempt_timeout()?;

        let mut prober = ServiceReadinessProber::new(stack)
            .with_attempt_timeout(attempt_timeout)
            .with_probe(Arc::new(HttpLivenessProbe::node(
                &settings.network_url,
                attempt_timeout,
            )?))
            .with_probe(Arc::new(GatewayStatusProbe::new(
                settings.gateway_url.clone(),
                attempt_timeout,
            )));

        if let Some(graphql_url) = &settings.graphql_url {
            prober = prober.with_probe(Arc::new(HttpLivenessProbe::graphql(
                graphql_url,
                attempt_timeout,
            )?));
        }

        Ok(prober)
    }

    async fn wait_ready(
        settings: &HarnessSettings,
        stack: Arc<dyn ServiceStack>,
    ) -> Result<(), HarnessError> {
        let policy = settings.backoff.readiness_policy()?;
        Self::prober(settings, stack)?
            .wait_ready(&settings.compose.services, &policy)
            .await?;
        Ok(())
    }

    /// A container reported as running may still refuse connections for a
    /// moment, so connecting is polled too. Migration failures are fatal.
    async fn prepare_storage(settings: &HarnessSettings) -> Result<Pool, HarnessError> {
        let pool = create_pool(&settings.storage_url, DEFAULT_POOL_SIZE)?;
        let policy = settings.backoff.readiness_policy()?;

        ConditionPoller::new("storage", &policy)
            .with_attempt_timeout(settings.backoff.attempt_timeout()?)
            .poll(|| {
                let pool = &pool;
                async move {
                    match run_migrations(pool).await {
                        Ok(()) => PollOutcome::Success(()),
                        Err(HarnessError::Pool(e)) => {
                            PollOutcome::retryable(format!("connection failed: {e}"))
                        }
                        Err(e) => PollOutcome::Fatal(e),
                    }
                }
            })
            .await?;

        Ok(pool)
    }

    async fn release_stack(settings: &HarnessSettings, stack: &dyn ServiceStack) {
        if settings.compose.keep_services {
            info!("Keeping services running for inspection");
            return;
        }
        if let Err(e) = stack.tear_down().await {
            warn!("Failed to tear down services: {e}");
        }
    }

    /// Brings the stack down unless `keep_services` is set. Safe to call more
    /// than once.
    pub async fn teardown(&self) -> Result<(), HarnessError> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.settings.compose.keep_services {
            info!("Keeping services running after session end");
            return Ok(());
        }
        info!("Tearing down harness session");
        self.stack.tear_down().await
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn store(&self) -> &PgCheckpointStore {
        &self.store
    }

    pub fn supervisor(&self) -> WorkerSupervisor {
        WorkerSupervisor::new(self.settings.worker_settings())
    }

    pub fn checkpoint_waiter(&self) -> CheckpointWaiter {
        CheckpointWaiter::new(Arc::new(self.store.clone()))
    }

    /// Waits on `run_id` under the configured indexer budget.
    pub async fn wait_until_indexed(
        &self,
        run_id: &str,
        target_block: u64,
    ) -> Result<u64, HarnessError> {
        let policy = self.settings.backoff.indexer_policy()?;
        self.checkpoint_waiter()
            .with_attempt_timeout(self.settings.backoff.attempt_timeout()?)
            .wait_until_indexed(run_id, target_block, &policy)
            .await
    }
}
