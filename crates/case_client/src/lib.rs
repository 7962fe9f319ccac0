use std::sync::Arc;

use anyhow::Result;

pub mod config;
pub mod error;
pub mod events;
pub mod generation;
pub mod session;
pub mod topology;
pub mod transport;

pub use config::{load_settings, ClientSettings};
pub use error::ClientError;
pub use events::{EventSubscription, GenerationEventSource, StreamMessage, WsEventSource};
pub use generation::{GenerationController, GenerationJob};
pub use session::SessionMachine;
pub use topology::Topology;
pub use transport::{
    AnonymousAuth, AuthProvider, GenerationApi, HttpTransport, SessionApi, StaticTokenAuth,
};

/// Composition root: one transport, one push-event source, and the two
/// context objects the presentation layer talks to.
pub struct CaseClient {
    settings: ClientSettings,
    generation: Arc<GenerationController>,
    session: Arc<SessionMachine>,
}

impl CaseClient {
    pub fn new(settings: ClientSettings, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&settings, Arc::clone(&auth))?);
        let events = Arc::new(WsEventSource::new(
            settings.events_base_url()?,
            settings.reconnect_delay(),
            auth,
        ));
        let generation = GenerationController::new(
            Arc::clone(&transport) as Arc<dyn GenerationApi>,
            events,
            settings.completion_grace(),
        );
        let session = SessionMachine::new(transport);
        Ok(Self {
            settings,
            generation,
            session,
        })
    }

    /// Builds a client from settings, using the configured access token when
    /// one is present.
    pub fn from_settings(settings: ClientSettings) -> Result<Self> {
        let auth: Arc<dyn AuthProvider> = match &settings.access_token {
            Some(token) => Arc::new(StaticTokenAuth::new(token.clone())),
            None => Arc::new(AnonymousAuth),
        };
        Self::new(settings, auth)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn generation(&self) -> &Arc<GenerationController> {
        &self.generation
    }

    pub fn session(&self) -> &Arc<SessionMachine> {
        &self.session
    }

    pub async fn shutdown(&self) {
        self.generation.clear().await;
    }
}

#[cfg(test)]
#[path = "tests/mock_server.rs"]
mod mock_server;
