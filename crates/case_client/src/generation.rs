//! Lifecycle of a "create a new case" request.
//!
//! The remote generator answers the create call right away and then reports
//! progress over a push stream. Every state change after acceptance comes from
//! that stream. Each start/restore/clear bumps an epoch, and anything still in
//! flight from an older epoch (a create response, a queued frame, the expiry
//! timer) is dropped on arrival instead of being cancelled.

use std::{
    ops::ControlFlow,
    sync::{Arc, Weak},
    time::Duration,
};

use futures::StreamExt;
use shared::{
    domain::{GenerationStatus, PublicId},
    protocol::{GenerationStreamEvent, SourceSelection},
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{generation_failure_message, GENERATION_START_FALLBACK_MESSAGE},
    events::{GenerationEventSource, StreamMessage},
    transport::GenerationApi,
};

pub const DEFAULT_COMPLETION_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenerationJob {
    pub status: GenerationStatus,
    /// Public id of the session being generated; unset while idle.
    pub job_id: Option<PublicId>,
    pub error_message: Option<String>,
    pub progress_message: Option<String>,
}

impl GenerationJob {
    fn in_stage(status: GenerationStatus, job_id: Option<PublicId>) -> Self {
        Self {
            status,
            job_id,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct ControllerState {
    job: GenerationJob,
    epoch: u64,
    subscription: Option<JoinHandle<()>>,
    expiry: Option<JoinHandle<()>>,
}

impl ControllerState {
    fn release_handles(&mut self) {
        if let Some(task) = self.subscription.take() {
            task.abort();
        }
        if let Some(task) = self.expiry.take() {
            task.abort();
        }
    }

    fn can_start(&self) -> bool {
        matches!(
            self.job.status,
            GenerationStatus::Idle | GenerationStatus::Failed
        )
    }
}

pub struct GenerationController {
    api: Arc<dyn GenerationApi>,
    events: Arc<dyn GenerationEventSource>,
    completion_grace: Duration,
    inner: Mutex<ControllerState>,
    updates: watch::Sender<GenerationJob>,
}

impl GenerationController {
    pub fn new(
        api: Arc<dyn GenerationApi>,
        events: Arc<dyn GenerationEventSource>,
        completion_grace: Duration,
    ) -> Arc<Self> {
        let (updates, _) = watch::channel(GenerationJob::default());
        Arc::new(Self {
            api,
            events,
            completion_grace,
            inner: Mutex::new(ControllerState::default()),
            updates,
        })
    }

    pub fn snapshot(&self) -> GenerationJob {
        self.updates.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GenerationJob> {
        self.updates.subscribe()
    }

    /// Requests a new case. Ignored unless the controller is idle or holds a
    /// failed job; the returned value is the job state once the create call
    /// has been answered (or immediately, when ignored).
    pub async fn start(self: &Arc<Self>, source: SourceSelection) -> GenerationJob {
        let epoch = {
            let mut state = self.inner.lock().await;
            if !state.can_start() {
                debug!(status = %state.job.status, "generation: start ignored, job in progress");
                return state.job.clone();
            }
            state.epoch += 1;
            state.release_handles();
            state.job = GenerationJob::in_stage(GenerationStatus::DraftingStory, None);
            self.publish(&state);
            state.epoch
        };

        info!(epoch, "generation: requesting new case");
        let outcome = self.api.create_job(&source).await;

        let mut state = self.inner.lock().await;
        if state.epoch != epoch {
            debug!(epoch, current = state.epoch, "generation: discarding stale create response");
            return state.job.clone();
        }

        match outcome {
            Ok(accepted) => {
                info!(epoch, public_id = %accepted.public_id, "generation: job accepted");
                state.job.job_id = Some(accepted.public_id.clone());
                self.open_subscription(&mut state, &accepted.public_id);
            }
            Err(err) => {
                warn!(epoch, "generation: create job rejected: {err:#}");
                state.job.status = GenerationStatus::Failed;
                state.job.error_message = Some(generation_failure_message(&err));
            }
        }
        self.publish(&state);
        state.job.clone()
    }

    /// Re-attaches to a job started elsewhere (for example before a reload).
    /// No create call is issued.
    pub async fn restore(self: &Arc<Self>, public_id: PublicId) -> GenerationJob {
        let mut state = self.inner.lock().await;
        if state.job.status != GenerationStatus::Idle {
            debug!(status = %state.job.status, "generation: restore ignored, controller busy");
            return state.job.clone();
        }
        state.epoch += 1;
        state.release_handles();
        state.job =
            GenerationJob::in_stage(GenerationStatus::DraftingStory, Some(public_id.clone()));
        info!(epoch = state.epoch, %public_id, "generation: restoring subscription");
        self.open_subscription(&mut state, &public_id);
        self.publish(&state);
        state.job.clone()
    }

    pub async fn clear(&self) {
        let mut state = self.inner.lock().await;
        state.epoch += 1;
        state.release_handles();
        state.job = GenerationJob::default();
        debug!(epoch = state.epoch, "generation: cleared");
        self.publish(&state);
    }

    fn publish(&self, state: &ControllerState) {
        self.updates.send_replace(state.job.clone());
    }

    fn open_subscription(self: &Arc<Self>, state: &mut ControllerState, public_id: &PublicId) {
        if let Some(previous) = state.subscription.take() {
            previous.abort();
        }

        let epoch = state.epoch;
        let mut subscription = self.events.subscribe(public_id);
        let controller: Weak<Self> = Arc::downgrade(self);
        state.subscription = Some(tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                match message {
                    StreamMessage::TransportError(reason) => {
                        warn!(epoch, "generation: event stream interrupted: {reason}");
                    }
                    StreamMessage::Frame(frame) => {
                        if controller.apply_frame(epoch, &frame).await.is_break() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    async fn apply_frame(self: &Arc<Self>, epoch: u64, frame: &str) -> ControlFlow<()> {
        let event = match serde_json::from_str::<GenerationStreamEvent>(frame) {
            Ok(event) => event,
            Err(err) => {
                debug!(epoch, "generation: ignoring malformed stream frame: {err}");
                return ControlFlow::Continue(());
            }
        };

        let mut state = self.inner.lock().await;
        if state.epoch != epoch {
            debug!(epoch, current = state.epoch, "generation: dropping event from stale subscription");
            return ControlFlow::Break(());
        }

        match event {
            GenerationStreamEvent::Progress { stage, message } => {
                let Some(status) = GenerationStatus::from_stage(&stage) else {
                    debug!(epoch, stage = %stage, "generation: ignoring unknown stage");
                    return ControlFlow::Continue(());
                };
                debug!(epoch, stage = %stage, "generation: progress");
                state.job.status = status;
                state.job.progress_message = message;
                self.publish(&state);
                ControlFlow::Continue(())
            }
            GenerationStreamEvent::Complete { public_id } => {
                info!(epoch, %public_id, "generation: case ready");
                // This task is the subscription; it ends once we return.
                state.subscription.take();
                state.job = GenerationJob::in_stage(GenerationStatus::Complete, Some(public_id));
                self.arm_expiry(&mut state);
                self.publish(&state);
                ControlFlow::Break(())
            }
            GenerationStreamEvent::Error { message } => {
                warn!(epoch, "generation: generator reported failure: {message}");
                state.subscription.take();
                state.job.status = GenerationStatus::Failed;
                state.job.progress_message = None;
                state.job.error_message = Some(if message.trim().is_empty() {
                    GENERATION_START_FALLBACK_MESSAGE.to_string()
                } else {
                    message
                });
                self.publish(&state);
                ControlFlow::Break(())
            }
        }
    }

    fn arm_expiry(self: &Arc<Self>, state: &mut ControllerState) {
        if let Some(previous) = state.expiry.take() {
            previous.abort();
        }
        let epoch = state.epoch;
        let grace = self.completion_grace;
        let controller = Arc::downgrade(self);
        state.expiry = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(controller) = controller.upgrade() {
                controller.expire(epoch).await;
            }
        }));
    }

    async fn expire(&self, epoch: u64) {
        let mut state = self.inner.lock().await;
        if state.epoch != epoch || state.job.status != GenerationStatus::Complete {
            return;
        }
        state.expiry.take();
        state.epoch += 1;
        state.job = GenerationJob::default();
        info!(epoch, "generation: completed job expired");
        self.publish(&state);
    }
}

impl Drop for GenerationController {
    fn drop(&mut self) {
        self.inner.get_mut().release_handles();
    }
}

#[cfg(test)]
#[path = "tests/generation_tests.rs"]
mod tests;
