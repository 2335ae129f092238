// panel-runtime/src/context.rs
use crate::auth::Authentication;
use crate::events::EventNode;
use crate::frames::FrameFactory;
use crate::history::HistoryStore;
use crate::transport::MessageBroker;
use common::{origin_of, RuntimeConfig};
use std::sync::Arc;

/// Shared plumbing handed to every panel and manager: configuration, the
/// transport broker, authentication, the frame factory, history and the
/// root of the event tree. One context per environment group.
pub struct RuntimeContext {
    pub config: Arc<RuntimeConfig>,
    pub broker: Arc<MessageBroker>,
    pub auth: Arc<Authentication>,
    pub frames: Arc<dyn FrameFactory>,
    pub history: Arc<HistoryStore>,
    pub events: Arc<EventNode>,
    /// Identifies this environment group on the wire
    pub group_id: String,
    /// The origin panels are trusted to report ready from
    pub allowed_origin: String,
}

impl RuntimeContext {
    pub fn new(
        config: Arc<RuntimeConfig>,
        broker: Arc<MessageBroker>,
        auth: Arc<Authentication>,
        frames: Arc<dyn FrameFactory>,
        history: Arc<HistoryStore>,
        events: Arc<EventNode>,
        group_id: impl Into<String>,
    ) -> Arc<Self> {
        let allowed_origin = origin_of(&config.environment_url)
            .unwrap_or_else(|_| config.environment_url.clone());
        Arc::new(Self {
            config,
            broker,
            auth,
            frames,
            history,
            events,
            group_id: group_id.into(),
            allowed_origin,
        })
    }

    /// Whether a URL points at an origin panels may navigate to
    pub fn is_allowed_origin(&self, url: &str) -> bool {
        let Ok(origin) = origin_of(url) else {
            return false;
        };
        if origin == self.allowed_origin {
            return true;
        }
        self.config
            .allowed_origins
            .iter()
            .any(|allowed| origin_of(allowed).map_or(allowed == &origin, |o| o == origin))
    }
}
