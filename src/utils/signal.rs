//! Signal handling for graceful shutdown
//!
//! Handlers are installed when [`ShutdownSignal`] is created, not when it is
//! first awaited, so a signal that arrives during startup is held until the
//! controller looks for it.

use tokio::signal;

use crate::severity::Notifier;

/// Termination signals (SIGTERM, SIGINT or Ctrl+C)
pub struct ShutdownSignal {
    #[cfg(unix)]
    sigterm: Option<signal::unix::Signal>,
    #[cfg(unix)]
    sigint: Option<signal::unix::Signal>,
    notifier: Notifier,
}

impl ShutdownSignal {
    /// Install the handlers
    ///
    /// Must be called inside the tokio runtime. A handler that can't be
    /// installed is reported; Ctrl+C is used in its place.
    pub fn register(notifier: Notifier) -> Self {
        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};

            let sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    notifier.warning(format!("Can't install the SIGTERM handler: {}", e));
                    None
                }
            };
            let sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => Some(s),
                Err(e) => {
                    notifier.warning(format!("Can't install the SIGINT handler: {}", e));
                    None
                }
            };

            Self {
                sigterm,
                sigint,
                notifier,
            }
        }

        #[cfg(not(unix))]
        {
            Self { notifier }
        }
    }

    /// Resolve on the first termination signal
    pub async fn recv(self) {
        #[cfg(unix)]
        {
            let Self {
                sigterm,
                sigint,
                notifier,
            } = self;

            match (sigterm, sigint) {
                (Some(mut sigterm), Some(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => notifier.info("Received SIGTERM"),
                        _ = sigint.recv() => notifier.info("Received SIGINT"),
                    }
                }
                (Some(mut sigterm), None) => {
                    tokio::select! {
                        _ = sigterm.recv() => notifier.info("Received SIGTERM"),
                        _ = signal::ctrl_c() => notifier.info("Received Ctrl+C"),
                    }
                }
                (None, Some(mut sigint)) => {
                    sigint.recv().await;
                    notifier.info("Received SIGINT");
                }
                (None, None) => ctrl_c(&notifier).await,
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c(&self.notifier).await;
        }
    }
}

async fn ctrl_c(notifier: &Notifier) {
    match signal::ctrl_c().await {
        Ok(()) => notifier.info("Received Ctrl+C"),
        Err(e) => {
            notifier.warning(format!("Can't listen for shutdown signals: {}", e));
            std::future::pending::<()>().await
        }
    }
}
