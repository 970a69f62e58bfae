//! Resilient Metrics Server
//!
//! Serves the metric registry at `/metrics`. If the listener loop fails after
//! startup the server re-binds and carries on, within a [`RestartBudget`]. An
//! exhausted budget is reported once on the failure channel returned by
//! [`MetricsServer::bind`] and the server stops.

mod budget;
mod http;

pub use budget::{BudgetDecision, RestartBudget, MAX_RESTARTS, RESTART_WINDOW};
pub use http::METRICS_PATH;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::ListenAddr;
use crate::error::{Error, Result};
use crate::metrics::ForexMetrics;

/// HTTP server for the metric registry
pub struct MetricsServer {
    addr: ListenAddr,
    listener: TcpListener,
    metrics: Arc<ForexMetrics>,
    grace_period: Duration,
    budget: RestartBudget,
    failures: oneshot::Sender<Error>,
}

impl MetricsServer {
    /// Bind the listener now, failing fast on a bad or busy address.
    ///
    /// The receiver yields at most one error: the restart budget ran out.
    pub async fn bind(
        addr: &ListenAddr,
        metrics: Arc<ForexMetrics>,
        grace_period: Duration,
    ) -> Result<(Self, oneshot::Receiver<Error>)> {
        let listener = bind_listener(addr).await?;
        let (failures, failure_rx) = oneshot::channel();

        let server = Self {
            addr: addr.clone(),
            listener,
            metrics,
            grace_period,
            budget: RestartBudget::default(),
            failures,
        };
        Ok((server, failure_rx))
    }

    /// Replace the default restart budget.
    pub fn with_budget(mut self, budget: RestartBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve in the background until `shutdown` fires or the budget runs out.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let connections = TaskTracker::new();
        let metrics = Arc::clone(&self.metrics);
        let serve_shutdown = shutdown.clone();
        let serve_connections = connections.clone();

        self.run_with(shutdown, connections, move |listener| {
            http::serve(
                listener,
                Arc::clone(&metrics),
                serve_shutdown.clone(),
                serve_connections.clone(),
            )
        })
        .await
    }

    /// Supervise `serve` on the bound listener, re-binding the same address
    /// after each failure, then drain `connections`.
    async fn run_with<F, Fut>(
        self,
        shutdown: CancellationToken,
        connections: TaskTracker,
        serve: F,
    ) where
        F: Fn(TcpListener) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let Self {
            addr,
            listener,
            metrics,
            grace_period,
            mut budget,
            failures,
        } = self;

        info!(addr = %addr, "Metrics server listening on {}{}", addr, METRICS_PATH);

        let serve = &serve;
        let mut initial = Some(listener);

        let result = supervise(
            &mut budget,
            || {
                let listener = initial.take();
                let addr = addr.clone();
                let shutdown = shutdown.clone();
                async move {
                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    let listener = match listener {
                        Some(listener) => listener,
                        None => bind_listener(&addr).await?,
                    };
                    serve(listener).await
                }
            },
            |_| metrics.record_server_restart(),
        )
        .await;

        if let Err(e) = result {
            error!(error = %e, "Metrics server giving up");
            // The receiver is gone only if the process is already exiting.
            let _ = failures.send(e);
        }

        connections.close();
        info!(
            grace_secs = grace_period.as_secs(),
            open_connections = connections.len(),
            "Shutting down metrics server"
        );
        if tokio::time::timeout(grace_period, connections.wait())
            .await
            .is_err()
        {
            let err = Error::ShutdownTimeout {
                component: "metrics server".to_string(),
                grace: grace_period,
            };
            error!(error = %err, "Error shutting down metrics server, bailing out");
        }
    }
}

impl std::fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsServer")
            .field("addr", &self.addr)
            .field("grace_period", &self.grace_period)
            .field("budget", &self.budget)
            .finish()
    }
}

async fn bind_listener(addr: &ListenAddr) -> Result<TcpListener> {
    TcpListener::bind((addr.host.as_str(), addr.port))
        .await
        .map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Run `serve` until it returns `Ok`, restarting it after every error while
/// `budget` allows. `on_restart` is called with the attempt number before
/// each restart.
///
/// Returns [`Error::RestartBudgetExhausted`] once the budget runs out.
pub async fn supervise<F, Fut, R>(
    budget: &mut RestartBudget,
    mut serve: F,
    mut on_restart: R,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
    R: FnMut(u32),
{
    loop {
        let err = match serve().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        error!(error = %err, "Local metrics server encountered error");

        match budget.record_failure(Instant::now()) {
            BudgetDecision::Restart { attempt } => {
                warn!(attempt, error = %err, "Restarting metrics server following recent error");
                on_restart(attempt);
            }
            BudgetDecision::Exhausted { restarts } => {
                error!(restarts, "Too many recent metrics server restarts");
                return Err(Error::RestartBudgetExhausted {
                    restarts,
                    last_error: err.to_string(),
                });
            }
        }
    }
}
