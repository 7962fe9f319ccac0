//! One investigation, driven against the server of record.
//!
//! Every mutating action is a two-phase sequence: send the action, then
//! re-fetch the whole snapshot and replace the cached copy. Nothing is merged
//! locally. Actions are serialized through `action_lock` so both phases of
//! one action finish before the next action starts.

use std::{collections::HashSet, future::Future, sync::Arc};

use anyhow::Result;
use shared::{
    domain::PublicId,
    protocol::{
        AccusationResult, AccuseRequest, ChatRequest, Evidence, MoveRequest, MoveResult, Session,
        SourceSelection,
    },
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{error::ClientError, topology::Topology, transport::SessionApi};

#[derive(Default)]
struct SessionState {
    snapshot: Option<Session>,
    accusation: Option<AccusationResult>,
}

pub struct SessionMachine {
    api: Arc<dyn SessionApi>,
    action_lock: Mutex<()>,
    inner: Mutex<SessionState>,
    updates: watch::Sender<Option<Session>>,
}

impl SessionMachine {
    pub fn new(api: Arc<dyn SessionApi>) -> Arc<Self> {
        let (updates, _) = watch::channel(None);
        Arc::new(Self {
            api,
            action_lock: Mutex::new(()),
            inner: Mutex::new(SessionState::default()),
            updates,
        })
    }

    pub async fn snapshot(&self) -> Option<Session> {
        self.inner.lock().await.snapshot.clone()
    }

    pub async fn accusation(&self) -> Option<AccusationResult> {
        self.inner.lock().await.accusation.clone()
    }

    pub async fn topology(&self) -> Topology {
        let guard = self.inner.lock().await;
        guard
            .snapshot
            .as_ref()
            .map(|session| Topology::resolve(&session.narrative_payload))
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.updates.subscribe()
    }

    pub async fn start(&self, source: SourceSelection) -> Result<Session> {
        let _action = self.action_lock.lock().await;
        let session = normalize(self.api.create_session(&source).await?);
        info!(public_id = %session.public_id, "session: started");
        self.replace(session.clone()).await;
        Ok(session)
    }

    pub async fn load(&self, public_id: &PublicId) -> Result<Session> {
        let _action = self.action_lock.lock().await;
        let session = normalize(self.api.fetch_session(public_id).await?);
        debug!(%public_id, status = %session.status, "session: loaded");
        self.replace(session.clone()).await;
        Ok(session)
    }

    /// Re-fetches the cached session. Used to observe server-side changes such
    /// as the clock lapsing.
    pub async fn refresh(&self, public_id: &PublicId) -> Result<Session> {
        let _action = self.action_lock.lock().await;
        self.refresh_snapshot(public_id).await
    }

    /// Question budget is enforced by the server; an exhausted budget comes
    /// back as a rejection.
    pub async fn ask(
        &self,
        public_id: &PublicId,
        question: &str,
        suspect_name: &str,
    ) -> Result<Session> {
        let request = ChatRequest {
            question: question.to_string(),
            suspect_name: suspect_name.to_string(),
        };
        self.mutate(public_id, "ask", |_| self.api.ask(public_id, &request))
            .await?;
        self.snapshot()
            .await
            .ok_or_else(|| ClientError::NoActiveSession(public_id.clone()).into())
    }

    pub async fn move_to(&self, public_id: &PublicId, location: &str) -> Result<MoveResult> {
        let request = MoveRequest {
            location: location.to_string(),
        };
        self.mutate(public_id, "move", |_| self.api.move_to(public_id, &request))
            .await
    }

    /// Returns only what this call turned up that was not already on file.
    /// "On file" is read under the action lock, so a queued investigation
    /// sees what the previous one recorded.
    pub async fn investigate(&self, public_id: &PublicId) -> Result<Vec<Evidence>> {
        let found = self
            .mutate(public_id, "investigate", |cached| async move {
                let mut seen: HashSet<_> =
                    cached.evidence.into_iter().map(|item| item.id).collect();
                let result = self.api.investigate(public_id).await?;
                Ok::<_, anyhow::Error>(
                    result
                        .evidence_found
                        .into_iter()
                        .filter(|item| seen.insert(item.id.clone()))
                        .collect::<Vec<_>>(),
                )
            })
            .await?;
        debug!(%public_id, found = found.len(), "session: investigation finished");
        Ok(found)
    }

    /// The verdict is final once the server has answered. It is stored and
    /// returned even when the follow-up refresh fails; the stored verdict
    /// alone keeps further actions refused until a later load.
    pub async fn accuse(
        &self,
        public_id: &PublicId,
        suspect_name: &str,
    ) -> Result<AccusationResult> {
        let request = AccuseRequest {
            suspect_name: suspect_name.to_string(),
        };
        let _action = self.action_lock.lock().await;
        self.ensure_accepting(public_id).await?;

        let result = self.api.accuse(public_id, &request).await.map_err(|err| {
            debug!(%public_id, action = "accuse", "session: action failed: {err:#}");
            err
        })?;
        info!(%public_id, correct = result.correct, "session: accusation resolved");
        self.inner.lock().await.accusation = Some(result.clone());

        if let Err(err) = self.refresh_snapshot(public_id).await {
            warn!(%public_id, "session: refresh after accusation failed: {err:#}");
        }
        Ok(result)
    }

    /// Runs one action under the action lock. `send` receives the cached
    /// snapshot as it stood once the lock was taken.
    async fn mutate<T, F, Fut>(
        &self,
        public_id: &PublicId,
        action: &'static str,
        send: F,
    ) -> Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _action = self.action_lock.lock().await;
        let cached = self.ensure_accepting(public_id).await?;

        let outcome = send(cached).await.map_err(|err| {
            debug!(%public_id, action, "session: action failed: {err:#}");
            err
        })?;
        self.refresh_snapshot(public_id).await?;
        Ok(outcome)
    }

    async fn ensure_accepting(&self, public_id: &PublicId) -> Result<Session, ClientError> {
        let guard = self.inner.lock().await;
        let Some(session) = guard
            .snapshot
            .as_ref()
            .filter(|session| &session.public_id == public_id)
        else {
            return Err(ClientError::NoActiveSession(public_id.clone()));
        };

        let verdict = guard
            .accusation
            .as_ref()
            .map(|result| result.status)
            .filter(|status| status.is_terminal());
        let closed = if session.is_active() {
            verdict
        } else {
            Some(session.status)
        };
        if let Some(status) = closed {
            return Err(ClientError::SessionClosed {
                public_id: public_id.clone(),
                status,
            });
        }
        Ok(session.clone())
    }

    async fn refresh_snapshot(&self, public_id: &PublicId) -> Result<Session> {
        let fresh = normalize(self.api.fetch_session(public_id).await?);

        let mut guard = self.inner.lock().await;
        match &guard.snapshot {
            Some(current) if current.public_id != fresh.public_id => {
                debug!(
                    %public_id,
                    cached = %current.public_id,
                    "session: dropping refresh for another session"
                );
                return Ok(fresh);
            }
            Some(current) if fresh.clock.minutes_used < current.clock.minutes_used => {
                warn!(
                    %public_id,
                    cached = current.clock.minutes_used,
                    fresh = fresh.clock.minutes_used,
                    "session: server clock went backwards"
                );
            }
            _ => {}
        }
        debug!(
            %public_id,
            status = %fresh.status,
            minutes_used = fresh.clock.minutes_used,
            "session: refreshed"
        );
        guard.snapshot = Some(fresh.clone());
        self.updates.send_replace(guard.snapshot.clone());
        Ok(fresh)
    }

    async fn replace(&self, session: Session) {
        let mut guard = self.inner.lock().await;
        guard.snapshot = Some(session);
        guard.accusation = None;
        self.updates.send_replace(guard.snapshot.clone());
    }
}

fn normalize(mut session: Session) -> Session {
    let mut seen = HashSet::new();
    session.evidence.retain(|item| seen.insert(item.id.clone()));
    session
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
