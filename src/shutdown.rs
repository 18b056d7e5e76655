//! Process lifecycle: one root cancellation token and the tasks hanging off it.
//!
//! Every long-running network task is spawned through [`ShutdownManager`]
//! under a name. On shutdown the token is tripped and the tasks are joined in
//! registration order; anything still running when the grace period ends is
//! aborted and reported by name.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const GRACE_PERIOD: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Spawn `task` and track it under `name`
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name, tokio::spawn(task)));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Block until Ctrl+C (or SIGTERM on unix), then shut down
    pub async fn wait_for_shutdown(self) {
        match termination_signal().await {
            Ok(signal) => tracing::info!("🛑 {} received, shutting down", signal),
            Err(e) => {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
        }
        self.shutdown().await;
    }

    /// Cancel every task and join them within the grace period.
    /// Returns false if some task had to be aborted.
    pub async fn shutdown(self) -> bool {
        self.cancel_token.cancel();

        let deadline = tokio::time::Instant::now() + GRACE_PERIOD;
        let mut stragglers = Vec::new();
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!("Task {} stopped", name),
                Ok(Err(e)) => tracing::warn!("Task {} ended abnormally: {}", name, e),
                Err(_) => {
                    handle.abort();
                    stragglers.push(name);
                }
            }
        }

        if stragglers.is_empty() {
            tracing::info!("✓ All tasks shut down gracefully");
            true
        } else {
            tracing::warn!(
                "⏱️  Shutdown timeout, aborted: {}",
                stragglers.join(", ")
            );
            false
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn termination_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "Ctrl+C"),
        _ = term.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl+C")
}
