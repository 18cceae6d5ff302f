//! Bounded wait for a Deployment to report availability.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use metrics::counter;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ClusterClient;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadinessError {
    #[error("deployment {deployment} not available within {}s", timeout.as_secs())]
    Timeout { deployment: String, timeout: Duration },
    #[error("watch on {deployment} failed: {reason}")]
    Watch { deployment: String, reason: String },
    #[error("readiness wait for {0} cancelled")]
    Cancelled(String),
}

/// True once the `Available` condition reports `True`.
pub fn is_available(d: &Deployment) -> bool {
    d.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Available" && c.status == "True"))
        .unwrap_or(false)
}

pub struct ReadinessWatcher {
    cluster: Arc<dyn ClusterClient>,
}

impl ReadinessWatcher {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self { Self { cluster } }

    /// Start watching in the background. The handle resolves with the outcome;
    /// cancelling the token stops the watch and the handle resolves `Cancelled`.
    pub fn wait_ready(&self, ns: &str, deployment: &str, timeout: Duration, cancel: CancellationToken) -> ReadinessHandle {
        let (tx, rx) = oneshot::channel();
        let cluster = Arc::clone(&self.cluster);
        let ns = ns.to_string();
        let name = deployment.to_string();
        tokio::spawn({
            let name = name.clone();
            async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(deployment = %name, "readiness: cancelled");
                        return;
                    }
                    r = watch_until_available(cluster, &ns, &name, timeout) => r,
                };
                let _ = tx.send(outcome);
            }
        });
        ReadinessHandle { deployment: name, rx }
    }
}

async fn watch_until_available(cluster: Arc<dyn ClusterClient>, ns: &str, name: &str, timeout: Duration) -> Result<(), ReadinessError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut rx = cluster
        .watch_deployment(ns, name, timeout)
        .await
        .map_err(|e| ReadinessError::Watch { deployment: name.to_string(), reason: e.to_string() })?;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(d)) => {
                if d.metadata.name.as_deref() == Some(name) && is_available(&d) {
                    info!(deployment = %name, "readiness: available");
                    return Ok(());
                }
            }
            // Closed subscription and an elapsed deadline are the same outcome.
            Ok(None) | Err(_) => {
                counter!("readiness_timeout_total", 1u64);
                return Err(ReadinessError::Timeout { deployment: name.to_string(), timeout });
            }
        }
    }
}

/// Completion handle for a readiness wait.
pub struct ReadinessHandle {
    deployment: String,
    rx: oneshot::Receiver<Result<(), ReadinessError>>,
}

impl ReadinessHandle {
    pub fn deployment(&self) -> &str { &self.deployment }
}

impl Future for ReadinessHandle {
    type Output = Result<(), ReadinessError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ReadinessError::Cancelled(self.deployment.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
