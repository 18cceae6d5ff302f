//! Skiff build coordination: publishes build requests and consumes build
//! responses, handing successful builds off for deployment.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use skiff_core::envelope::{BuildRequest, BuildResponse, BuildStatus, SourceCredentials};
use skiff_core::{AppId, Application, PlatformConfig, PlatformError};
use skiff_provision::ResourceProvisioner;
use skiff_queue::{codec, BuildQueueClient, Delivery, QueueError};
use skiff_store::ResourceStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receiver of a successfully built image.
#[async_trait]
pub trait BuildHandoff: Send + Sync {
    async fn deploy(&self, app_id: AppId, image: &str, commit: Option<&str>, cancel: &CancellationToken) -> Result<Application, PlatformError>;
}

#[async_trait]
impl BuildHandoff for ResourceProvisioner {
    async fn deploy(&self, app_id: AppId, image: &str, commit: Option<&str>, cancel: &CancellationToken) -> Result<Application, PlatformError> {
        self.deploy_build(app_id, image, commit, cancel).await
    }
}

/// How a consumed message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Undecodable, or a success without an image; nothing to correlate.
    Malformed,
    /// The builder reported a failure. The application record is left untouched.
    BuildFailed,
    HandoffFailed,
}

/// Pause after a failed receive before asking the broker again.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(500);

fn queue_err(e: QueueError) -> PlatformError { PlatformError::Queue(e.to_string()) }

pub struct BuildCoordinator {
    queue: Arc<dyn BuildQueueClient>,
    store: Arc<dyn ResourceStore>,
    handoff: Arc<dyn BuildHandoff>,
    request_queue: String,
    response_queue: String,
}

impl BuildCoordinator {
    pub fn new(
        queue: Arc<dyn BuildQueueClient>,
        store: Arc<dyn ResourceStore>,
        handoff: Arc<dyn BuildHandoff>,
        cfg: &PlatformConfig,
    ) -> Self {
        Self {
            queue,
            store,
            handoff,
            request_queue: cfg.request_queue.clone(),
            response_queue: cfg.response_queue.clone(),
        }
    }

    /// Move the application into its build state, persist it, and publish the
    /// request. A failed publish leaves the record `Failed`.
    pub async fn request_build(&self, app: &mut Application, credentials: SourceCredentials) -> Result<(), PlatformError> {
        let target = match app.state.build_target() {
            Some(t) if app.state.can_request_build() => t,
            _ => {
                return Err(PlatformError::InvalidState { app: app.name.clone(), state: app.state, op: "request build".into() })
            }
        };
        let req = BuildRequest::for_application(app, credentials).ok_or_else(|| PlatformError::MissingSource(app.name.clone()))?;
        let payload = codec::encode_request(&req).map_err(|e| PlatformError::Queue(e.to_string()))?;

        app.transition(target)?;
        self.store.update_by_id(app.id, app).await?;

        if let Err(e) = self.queue.publish(&self.request_queue, payload).await {
            counter!("build_publish_err", 1u64);
            error!(app = %app.name, app_id = %app.id, error = %e, "build: publish failed");
            app.mark_failed();
            if let Err(se) = self.store.update_by_id(app.id, app).await {
                warn!(app = %app.name, app_id = %app.id, error = %se, "build: could not persist failed state");
            }
            return Err(queue_err(e));
        }
        counter!("build_requests_total", 1u64);
        info!(app = %app.name, app_id = %app.id, state = %app.state, queue = %self.request_queue, "build: requested");
        Ok(())
    }

    /// Process one response and settle it. Only a completed hand-off is acked.
    pub async fn handle_delivery(&self, d: &Delivery) -> Result<Settlement, PlatformError> {
        counter!("build_responses_total", 1u64);
        let resp = match codec::decode_response(&d.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(tag = d.tag, error = %e, "build: malformed response");
                return self.drop_message(d, DropReason::Malformed).await;
            }
        };
        let BuildResponse { app_id, status, image, commit, error } = resp;
        match (status, image) {
            (BuildStatus::Failed, _) => {
                let (fault, message) = match &error {
                    Some(f) => (format!("{:?}", f.fault).to_lowercase(), f.message.clone()),
                    None => ("unknown".to_string(), String::new()),
                };
                // The record is not written back; it stays in its build state.
                warn!(app_id = %app_id, fault = %fault, message = %message, "build: builder reported failure");
                self.drop_message(d, DropReason::BuildFailed).await
            }
            (BuildStatus::Success, None) => {
                warn!(app_id = %app_id, "build: success without image reference");
                self.drop_message(d, DropReason::Malformed).await
            }
            (BuildStatus::Success, Some(image)) => {
                // Hand-off always runs to completion; readiness is bounded by its own timeout.
                let done = CancellationToken::new();
                match self.handoff.deploy(app_id, &image, commit.as_deref(), &done).await {
                    Ok(app) => {
                        self.queue.ack(d.tag).await.map_err(queue_err)?;
                        info!(app = %app.name, app_id = %app_id, state = %app.state, image = %image, "build: deployed");
                        Ok(Settlement::Acked)
                    }
                    Err(e) => {
                        error!(app_id = %app_id, error = %e, "build: hand-off failed");
                        self.drop_message(d, DropReason::HandoffFailed).await
                    }
                }
            }
        }
    }

    async fn drop_message(&self, d: &Delivery, reason: DropReason) -> Result<Settlement, PlatformError> {
        counter!("build_responses_dropped", 1u64);
        self.queue.nack(d.tag, false).await.map_err(queue_err)?;
        Ok(Settlement::Dropped(reason))
    }

    /// Consume responses one at a time until cancelled or the queue closes.
    /// Cancellation is observed only between messages. Receive and settle
    /// errors are logged and the loop carries on. Returns how many were settled.
    pub async fn run_consumer(&self, cancel: CancellationToken) -> Result<u64, PlatformError> {
        let mut settled = 0u64;
        info!(queue = %self.response_queue, "build: consumer started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("build: consumer cancelled");
                    break;
                }
                d = self.queue.next_delivery(&self.response_queue) => d,
            };
            let d = match next {
                Ok(Some(d)) => d,
                Ok(None) => {
                    info!(queue = %self.response_queue, "build: response queue closed");
                    break;
                }
                Err(e) => {
                    counter!("build_receive_err", 1u64);
                    error!(queue = %self.response_queue, error = %e, "build: receive failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
                    }
                    continue;
                }
            };
            match self.handle_delivery(&d).await {
                Ok(outcome) => {
                    debug!(tag = d.tag, ?outcome, "build: settled");
                    settled += 1;
                }
                Err(e) => {
                    counter!("build_settle_err", 1u64);
                    error!(tag = d.tag, redelivered = d.redelivered, error = %e, "build: could not settle response");
                }
            }
        }
        Ok(settled)
    }
}
