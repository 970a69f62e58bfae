//! Shutdown Coordinator
//!
//! One place that listens for termination signals and winds every subsystem
//! down. Subsystems take a child of the coordinator's token and register their
//! task handle; [`ShutdownCoordinator::shutdown`] cancels the root token once
//! and waits for every registered task, bounded by the grace period.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Extra time on top of the grace period for subsystems to report back
/// after their own grace period ran out.
const JOIN_MARGIN: Duration = Duration::from_secs(1);

/// Termination signals observed by [`ShutdownCoordinator::wait_for_signal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Broadcasts shutdown to every registered subsystem and joins them.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: TaskTracker,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            grace_period,
        }
    }

    /// Token for one subsystem; cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Register a subsystem task to be joined on shutdown.
    pub fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.spawn(async move {
            match handle.await {
                Ok(()) => debug!(subsystem = name, "Subsystem stopped"),
                Err(e) => error!(subsystem = name, error = %e, "Subsystem task failed"),
            }
        });
    }

    /// True once shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for SIGINT or SIGTERM.
    pub async fn wait_for_signal(&self) -> Result<ShutdownSignal> {
        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate())?.recv().await;
            Ok::<_, Error>(())
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Result<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok(ShutdownSignal::Interrupt)
            }
            result = terminate => {
                result?;
                Ok(ShutdownSignal::Terminate)
            }
        }
    }

    /// Run until `signal` resolves or a subsystem reports a fatal error on
    /// `failures`, then shut every subsystem down.
    ///
    /// Returns the error that stopped the process. Failing to listen for
    /// signals is fatal too; a shutdown timeout is only logged.
    pub async fn run_until<S>(
        &self,
        signal: S,
        mut failures: oneshot::Receiver<Error>,
    ) -> Result<()>
    where
        S: Future<Output = Result<ShutdownSignal>>,
    {
        let fatal = tokio::select! {
            signal = signal => match signal {
                Ok(signal) => {
                    info!(%signal, "Received signal, shutting down");
                    None
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for termination signals");
                    Some(e)
                }
            },
            Ok(e) = &mut failures => {
                error!(error = %e, "Stopping due to subsystem failure");
                Some(e)
            }
        };

        if let Err(e) = self.shutdown().await {
            error!(error = %e, "Error during shutdown, exiting anyway");
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel every subsystem and wait for them to stop.
    ///
    /// Returns [`Error::ShutdownTimeout`] if they have not all stopped within
    /// the grace period; the tasks are left running in that case.
    pub async fn shutdown(&self) -> Result<()> {
        info!(
            grace_secs = self.grace_period.as_secs(),
            subsystems = self.tasks.len(),
            "Shutting down"
        );
        self.token.cancel();
        self.tasks.close();

        let deadline = self.grace_period + JOIN_MARGIN;
        match tokio::time::timeout(deadline, self.tasks.wait()).await {
            Ok(()) => {
                info!("All subsystems stopped");
                Ok(())
            }
            Err(_) => Err(Error::ShutdownTimeout {
                component: format!("{} subsystem(s)", self.tasks.len()),
                grace: self.grace_period,
            }),
        }
    }
}
