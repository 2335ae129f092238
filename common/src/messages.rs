// common/src/messages.rs
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Cross-frame message names, as they appear on the wire.
pub mod names {
    /// child -> parent: announce existence, request a logical name
    pub const REGISTER_CHILD: &str = "register-child";
    /// parent -> child: assign the logical name
    pub const REGISTER_WINDOW: &str = "register-window";
    /// child -> parent: frame loaded and listening
    pub const READY: &str = "ready";
    /// child -> parent: frame about to navigate away or unload
    pub const UNREADY: &str = "unready";
    /// either direction: acknowledges a prior message by id
    pub const RECEIPT: &str = "message-receipt";
    /// parent -> child: request graceful teardown
    pub const CLOSE: &str = "close";
    /// child -> parent: teardown finished
    pub const CLOSED: &str = "closed";
    /// parent -> child: already loaded, just bring to front
    pub const SHOW: &str = "show";
    /// parent -> child: in-place navigation without a full reload
    pub const TURBO_VISIT: &str = "turbo-visit";
    /// parent -> child: push computed CSS and class name into the frame
    pub const STYLES: &str = "styles";
    /// parent -> child: force a content refresh
    pub const RELOAD: &str = "reload";
    /// parent -> child: forward a keyboard event to the active overlay
    pub const KEY_TRIGGER: &str = "key:trigger";
    /// child -> parent: frame asks to be closed
    pub const REQUEST_CLOSE: &str = "request:close";
    /// child -> parent: frame asks to be reset
    pub const REQUEST_RESET: &str = "request:reset";
    /// child -> parent: frame requests a new overlay
    pub const OVERLAY_OPEN: &str = "overlay-open";
    /// child -> parent: frame requests app navigation
    pub const NAVIGATION_OPEN: &str = "navigation-open";
    /// parent -> child: status probe for frame-blockage diagnostics
    pub const PING: &str = "ping";
}

/// A structured message exchanged between a parent document and an embedded
/// frame. Every non-receipt, non-unready message that carries a `message_id`
/// expects a `message-receipt` with the matching id within the configured
/// timeout window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub name: String,
    /// Identifies the environment group the message belongs to
    pub group_id: String,
    /// Logical name of the target (or source) window, when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_name: Option<String>,
    /// Correlation id for acknowledgement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    /// Remaining message fields
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl WireMessage {
    pub fn new(name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_id: group_id.into(),
            window_name: None,
            message_id: None,
            payload: Map::new(),
        }
    }

    pub fn with_window(mut self, window_name: impl Into<String>) -> Self {
        self.window_name = Some(window_name.into());
        self
    }

    pub fn with_id(mut self, message_id: Uuid) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Build the receipt acknowledging this message
    pub fn receipt(&self) -> Option<WireMessage> {
        let id = self.message_id?;
        Some(
            WireMessage::new(names::RECEIPT, self.group_id.clone())
                .with_id(id)
                .with_field("received", Value::String(self.name.clone())),
        )
    }

    /// Whether this message can be acknowledged at all. Receipts are never
    /// acknowledged, and `unready` cannot be: its source context may already
    /// be gone.
    pub fn expects_receipt(&self) -> bool {
        self.name != names::RECEIPT && self.name != names::UNREADY && self.message_id.is_some()
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn field_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}

/// Payload of a `ready` message: the frame confirms it has loaded, reporting
/// where it landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub location: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ReadyPayload {
    /// Extract a ready payload from a wire message
    pub fn from_message(message: &WireMessage) -> Option<Self> {
        serde_json::from_value(Value::Object(message.payload.clone())).ok()
    }
}

/// Payload of a `styles` message pushed into a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StylesPayload {
    pub css: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

/// Payload of a `turbo-visit` in-place navigation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitPayload {
    pub url: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// "advance" or "replace"
    pub action: String,
}
