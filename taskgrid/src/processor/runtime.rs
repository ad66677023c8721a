//! The processor's timer loops.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::client::DispatcherClient;
use super::executor::FunctionExecutor;
use super::requestor::{DispatcherRequestor, TickOutcome};
use super::round_robin::RoundRobin;
use crate::cancellation::CancellationToken;
use crate::config::ProcessorConfig;
use crate::errors::ConfigError;
use crate::observability::SpanTimer;

/// Runs the request, task and cleanup loops of one processor.
///
/// The request loop talks to one endpoint per tick, chosen by
/// [`RoundRobin`]. The task loop starts execution of received tasks. The
/// cleanup loop abandons executions that overran their deadline.
pub struct ProcessorRuntime {
    config: ProcessorConfig,
    rotation: RoundRobin,
    requestors: Vec<Arc<DispatcherRequestor>>,
    executor: Arc<dyn FunctionExecutor>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ProcessorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRuntime")
            .field("rotation", &self.rotation)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl ProcessorRuntime {
    /// Validates the configuration and builds one requestor per enabled
    /// endpoint entry. Entries sharing a url still get separate requestors.
    pub fn new(
        config: ProcessorConfig,
        client: Arc<dyn DispatcherClient>,
        executor: Arc<dyn FunctionExecutor>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rotation = RoundRobin::new(&config.endpoints)?;
        let requestors = rotation
            .endpoints()
            .iter()
            .map(|endpoint| {
                DispatcherRequestor::new(endpoint.clone(), config.tags.clone(), Arc::clone(&client)).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            rotation,
            requestors,
            executor,
            shutdown: CancellationToken::new(),
        })
    }

    /// Builds a runtime that talks HTTP with the configured request timeout.
    #[cfg(feature = "client")]
    pub fn over_http(config: ProcessorConfig, executor: Arc<dyn FunctionExecutor>) -> Result<Self, crate::errors::TaskgridError> {
        let client = super::client::HttpDispatcherClient::new(config.request_timeout())?;
        Ok(Self::new(config, Arc::new(client), executor)?)
    }

    /// The token that stops every loop.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The requestors, in rotation order.
    #[must_use]
    pub fn requestors(&self) -> &[Arc<DispatcherRequestor>] {
        &self.requestors
    }

    /// One request cycle against the next endpoint in rotation.
    ///
    /// Returns `None` when the exchange failed; the failure is logged and
    /// the next call moves on to the following endpoint.
    pub async fn request_tick(&self) -> Option<TickOutcome> {
        let requestor = self.requestors.get(self.rotation.next_index())?;
        let endpoint = requestor.endpoint();
        let timer = SpanTimer::start("processor.request_tick");
        let outcome = requestor.tick().await;
        timer.finish();
        match outcome {
            Ok(outcome) => {
                debug!(endpoint = %endpoint.url, outcome = ?outcome, "request tick");
                Some(outcome)
            }
            Err(e) => {
                warn!(endpoint = %endpoint.url, error = %e, "request tick failed");
                None
            }
        }
    }

    /// Starts every received task on every endpoint. Returns how many started.
    pub fn task_tick(&self) -> usize {
        self.requestors.iter().map(|r| r.start_received(&self.executor)).sum()
    }

    /// Abandons overdue executions. Returns how many.
    pub fn cleanup_tick(&self) -> usize {
        let now = Instant::now();
        self.requestors.iter().map(|r| r.abandon_overdue(now)).sum()
    }

    /// Spawns the three loops. They run until the shutdown token is cancelled.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            endpoints = self.rotation.len(),
            request_secs = self.config.request_interval().as_secs(),
            task_secs = self.config.task_interval().as_secs(),
            cleanup_secs = self.config.cleanup_interval().as_secs(),
            "processor starting"
        );
        let request = {
            let rt = Arc::clone(self);
            spawn_loop("request", self.config.request_interval(), self.shutdown.clone(), move || {
                let rt = Arc::clone(&rt);
                async move {
                    rt.request_tick().await;
                }
            })
        };
        let task = {
            let rt = Arc::clone(self);
            spawn_loop("task", self.config.task_interval(), self.shutdown.clone(), move || {
                let rt = Arc::clone(&rt);
                async move {
                    let started = rt.task_tick();
                    if started > 0 {
                        debug!(started, "tasks started");
                    }
                }
            })
        };
        let cleanup = {
            let rt = Arc::clone(self);
            spawn_loop("cleanup", self.config.cleanup_interval(), self.shutdown.clone(), move || {
                let rt = Arc::clone(&rt);
                async move {
                    rt.cleanup_tick();
                }
            })
        };
        vec![request, task, cleanup]
    }

    /// Runs the loops until the shutdown token is cancelled.
    pub async fn run(self: Arc<Self>) {
        for result in futures::future::join_all(self.start()).await {
            if let Err(e) = result {
                warn!(error = %e, "processor loop ended abnormally");
            }
        }
        info!(reason = ?self.shutdown.reason(), "processor stopped");
    }
}

fn spawn_loop<F, Fut>(name: &'static str, period: Duration, shutdown: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
        debug!(loop_name = name, "loop stopped");
    })
}
