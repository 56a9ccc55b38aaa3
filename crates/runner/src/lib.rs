//! Runs named long-lived processes side by side and shuts them down together.
//!
//! Every process receives a [`CancellationToken`]. The token is cancelled on
//! SIGINT/SIGTERM or as soon as any process fails, after which the remaining
//! processes are awaited and the registered closers run under a timeout.
//!
//! ```no_run
//! use cloudsight_runner::Runner;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! Runner::new()
//!     .with_app_process("ticker", |ctx| async move {
//!         loop {
//!             tokio::select! {
//!                 _ = ctx.cancelled() => break,
//!                 _ = tokio::time::sleep(Duration::from_secs(1)) => tracing::info!("tick"),
//!             }
//!         }
//!         Ok(())
//!     })
//!     .with_closer("flush", || async move { Ok(()) })
//!     .with_closer_timeout(Duration::from_secs(5))
//!     .run()
//!     .await
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type BoxedFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A long-running process; it should return once the token is cancelled
pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> BoxedFuture + Send>;

/// Cleanup run after all processes have stopped
pub type Closer = Box<dyn FnOnce() -> BoxedFuture + Send>;

pub struct Runner {
    app_processes: Vec<(String, AppProcess)>,
    closers: Vec<(String, Closer)>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// A runner with no processes and a 10 second closer timeout
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Register a process. If it returns an error, every other process is
    /// cancelled and the error is returned from [`run`](Self::run).
    pub fn with_app_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.app_processes.push((
            name.into(),
            Box::new(move |token| -> BoxedFuture { Box::pin(process(token)) }),
        ));
        self
    }

    /// Register a cleanup step. All closers run, even if some fail.
    pub fn with_closer<F, Fut>(mut self, name: impl Into<String>, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push((
            name.into(),
            Box::new(move || -> BoxedFuture { Box::pin(closer()) }),
        ));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Use an externally owned token, e.g. to stop the runner from a test
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Run until a signal arrives or a process stops, then run the closers.
    ///
    /// Returns the first process error, if any.
    pub async fn run(self) -> anyhow::Result<()> {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for (name, process) in self.app_processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                tracing::info!(process = %name, "starting process");
                let result = process(process_token).await;
                (name, result)
            });
        }

        spawn_signal_handlers(token.clone());

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::info!(process = %name, "process stopped");
                }
                Ok((name, Err(err))) => {
                    if token.is_cancelled() {
                        tracing::warn!(process = %name, error = %format!("{:#}", err), "process failed during shutdown");
                    } else {
                        tracing::error!(process = %name, error = %format!("{:#}", err), "process failed");
                        first_error = Some(err.context(format!("process '{}' failed", name)));
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "process panicked");
                    if first_error.is_none() && !token.is_cancelled() {
                        first_error = Some(anyhow::anyhow!("process panicked: {}", err));
                    }
                }
            }

            // One process ending stops the others
            token.cancel();
        }
        token.cancel();

        if !self.closers.is_empty() {
            tracing::info!(timeout = ?self.closer_timeout, "running closers");

            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => tracing::info!("all closers completed"),
                Err(_) => tracing::error!(timeout = ?self.closer_timeout, "closers timed out"),
            }
        }

        match first_error {
            Some(err) => {
                tracing::error!(error = %format!("{:#}", err), "runner exiting with error");
                Err(err)
            }
            None => {
                tracing::info!("runner exiting normally");
                Ok(())
            }
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = ctrl_c_token.cancelled() => {}
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    tracing::info!("received SIGINT");
                    ctrl_c_token.cancel();
                }
                Err(err) => tracing::error!(error = %err, "failed to listen for SIGINT"),
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                return;
            }
        };

        tokio::select! {
            _ = token.cancelled() => {}
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
                token.cancel();
            }
        }
    });

    #[cfg(not(unix))]
    drop(token);
}

async fn run_closers(closers: Vec<(String, Closer)>) {
    let mut closer_set = JoinSet::new();

    for (name, closer) in closers {
        closer_set.spawn(async move { (name, closer().await) });
    }

    while let Some(joined) = closer_set.join_next().await {
        match joined {
            Ok((name, Ok(()))) => tracing::debug!(closer = %name, "closer completed"),
            Ok((name, Err(err))) => {
                tracing::error!(closer = %name, error = %format!("{:#}", err), "closer failed")
            }
            Err(err) => tracing::error!(error = %err, "closer panicked"),
        }
    }
}
