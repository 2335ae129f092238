// panel-runtime/src/overlay.rs
//
// Registry of ad-hoc panels (previews, file pickers, modals) keyed by a
// logical overlay id. At most one live panel per id; re-requesting an id
// reuses the panel. The registry doubles as the z-order tracker: the
// most-recently-opened overlay sits on top and is the only one that
// receives routed keyboard events.

use crate::context::RuntimeContext;
use crate::events::EventNode;
use crate::panel::{Panel, PanelOptions};
use crate::transport::{InboundEnvelope, ListenerId};
use common::{names, BridgeError, WireMessage};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};

/// What a caller (or a frame, via `overlay-open`) asks the manager for
#[derive(Debug, Clone, Default)]
pub struct OverlayRequest {
    pub overlay_id: Option<String>,
    pub overlay_type: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
}

impl OverlayRequest {
    fn from_message(message: &WireMessage) -> Self {
        Self {
            overlay_id: message.field_str("overlay_id").map(str::to_string),
            overlay_type: message.field_str("type").map(str::to_string),
            title: message.field_str("title").map(str::to_string),
            url: message.field_str("url").map(str::to_string),
        }
    }

    /// The effective overlay type, after URL classification. Attachment
    /// preview URLs always route to the preview overlay, whatever type the
    /// caller asked for.
    fn effective_type(&self) -> String {
        if self.url.as_deref().map(is_preview_path).unwrap_or(false) {
            return "preview".to_string();
        }
        self.overlay_type
            .clone()
            .unwrap_or_else(|| "overlay".to_string())
    }

    fn effective_id(&self) -> String {
        self.overlay_id
            .clone()
            .unwrap_or_else(|| self.effective_type())
    }
}

/// Whether a URL path targets an attachment preview (`/attachments/<id>`)
fn is_preview_path(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segments: Vec<&str> = path.split('/').collect();
    segments.windows(2).any(|pair| {
        pair[0] == "attachments"
            && !pair[1].is_empty()
            && pair[1].bytes().all(|b| b.is_ascii_digit())
    })
}

pub struct OverlayManager {
    ctx: Arc<RuntimeContext>,
    events: Arc<EventNode>,
    /// Insertion-ordered; the last entry is the top of the z-order
    overlays: Mutex<Vec<(String, Arc<Panel>)>>,
    listener: Mutex<Option<ListenerId>>,
}

impl OverlayManager {
    pub fn new(ctx: Arc<RuntimeContext>) -> Arc<Self> {
        let events = EventNode::new("overlays");
        events.set_parent(Some(&ctx.events));

        let manager = Arc::new(Self {
            ctx,
            events,
            overlays: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        });

        // frames request overlays of their own
        let weak: Weak<OverlayManager> = Arc::downgrade(&manager);
        let listener = manager.ctx.broker.add_listener(
            names::OVERLAY_OPEN,
            Arc::new(move |envelope: &InboundEnvelope| {
                if let Some(manager) = weak.upgrade() {
                    let request = OverlayRequest::from_message(&envelope.message);
                    tokio::spawn(async move {
                        if let Err(e) = manager.open(request).await {
                            tracing::warn!("Frame-requested overlay failed: {}", e);
                        }
                    });
                }
            }),
        );
        *manager.listener.lock().unwrap() = Some(listener);
        manager
    }

    pub fn events(&self) -> &Arc<EventNode> {
        &self.events
    }

    /// The panel for an overlay id, creating it on first request. A hit
    /// reuses the existing panel and only refreshes its title.
    pub fn get_overlay(self: &Arc<Self>, request: &OverlayRequest) -> Arc<Panel> {
        let id = request.effective_id();

        if let Some(panel) = self.lookup(&id) {
            if request.title.is_some() {
                panel.set_title(request.title.clone());
            }
            return panel;
        }

        let overlay_type = request.effective_type();
        tracing::debug!("Creating overlay '{}' ({})", id, overlay_type);
        let panel = Panel::new(
            self.ctx.clone(),
            &id,
            PanelOptions {
                panel_type: Some(overlay_type.clone()),
                persistent: false,
                title: request.title.clone(),
                css_class: Some(overlay_type),
            },
        );
        panel.events().set_parent(Some(&self.events));
        self.overlays
            .lock()
            .unwrap()
            .push((id, panel.clone()));
        panel
    }

    /// Open an overlay for a request, classifying preview URLs, and move it
    /// to the top of the z-order
    pub async fn open(self: &Arc<Self>, request: OverlayRequest) -> Result<Arc<Panel>, BridgeError> {
        let panel = self.get_overlay(&request);
        panel.open(request.url.as_deref(), false).await?;
        self.move_to_top(panel.panel_id());
        let _ = self.events.trigger(
            "overlay-opened",
            json!({ "overlay_id": panel.panel_id() }),
        );
        Ok(panel)
    }

    /// Close every tracked overlay concurrently and wait for all of them
    pub async fn close_all(&self, no_history: bool) {
        let open: Vec<Arc<Panel>> = {
            let overlays = self.overlays.lock().unwrap();
            overlays
                .iter()
                .filter(|(_, panel)| panel.is_open())
                .map(|(_, panel)| panel.clone())
                .collect()
        };

        let results = join_all(
            open.iter()
                .map(|panel| panel.close(no_history, false)),
        )
        .await;

        for (panel, result) in open.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Overlay '{}' failed to close: {}", panel.panel_id(), e);
            }
        }
    }

    /// The top-most open overlay
    pub fn top(&self) -> Option<Arc<Panel>> {
        self.overlays
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, panel)| panel.is_open())
            .map(|(_, panel)| panel.clone())
    }

    /// Depth of an open overlay in the z-order; the top-most is 0
    pub fn depth_of(&self, overlay_id: &str) -> Option<usize> {
        self.overlays
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|(_, panel)| panel.is_open())
            .position(|(id, _)| id == overlay_id)
    }

    /// Route a keyboard event to the top-most open overlay only. Escape
    /// closes it; anything else is forwarded into its frame.
    pub async fn route_key(&self, key: &str) -> Result<(), BridgeError> {
        let Some(panel) = self.top() else {
            return Ok(());
        };

        if key == "Escape" {
            return panel.close(false, false).await;
        }

        if panel.is_ready() {
            let message = WireMessage::new(names::KEY_TRIGGER, &self.ctx.group_id)
                .with_field("key", Value::String(key.to_string()));
            panel.post_message(message).await?;
        } else {
            tracing::debug!(
                "Dropping key '{}' for unready overlay '{}'",
                key,
                panel.panel_id()
            );
        }
        Ok(())
    }

    pub fn overlay_ids(&self) -> Vec<String> {
        self.overlays
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn lookup(&self, overlay_id: &str) -> Option<Arc<Panel>> {
        self.overlays
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == overlay_id)
            .map(|(_, panel)| panel.clone())
    }

    fn move_to_top(&self, overlay_id: &str) {
        let mut overlays = self.overlays.lock().unwrap();
        if let Some(index) = overlays.iter().position(|(id, _)| id == overlay_id) {
            let entry = overlays.remove(index);
            overlays.push(entry);
        }
    }
}

impl Drop for OverlayManager {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(id) = listener.take() {
                self.ctx.broker.remove_listener(names::OVERLAY_OPEN, id);
            }
        }
    }
}
