// panel-runtime/src/panel.rs
//
// The lifecycle state machine for one embedded content surface. A panel
// owns its frame and transport registration exclusively; everything the
// rest of the system learns about it flows out through events.
//
// Lifecycle: Created -> Configured -> Unloaded -> Loading -> Ready, with
// Ready <-> Unready on in-frame navigation, open/close orthogonal to
// readiness, Reset recreating the frame, and Removed terminal.

use crate::context::RuntimeContext;
use crate::deferred::Deferred;
use crate::events::EventNode;
use crate::frames::FrameWindow;
use crate::transport::{InboundEnvelope, ListenerId, WindowChannel};
use chrono::{DateTime, Utc};
use common::{names, BridgeError, PanelState, ReadyPayload, StylesPayload, VisitPayload, WireMessage};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use url::Url;

/// Caller metadata attached to a panel
#[derive(Debug, Clone, Default)]
pub struct PanelOptions {
    pub panel_type: Option<String>,
    /// Persistent panels keep their content alive while closed
    pub persistent: bool,
    pub title: Option<String>,
    pub css_class: Option<String>,
}

pub struct Panel {
    ctx: Arc<RuntimeContext>,
    panel_id: String,
    events: Arc<EventNode>,
    options: Mutex<PanelOptions>,

    frame: Mutex<Option<Arc<dyn FrameWindow>>>,
    channel: Mutex<Option<WindowChannel>>,

    location: Mutex<Option<String>>,
    status_code: Mutex<Option<u16>>,
    title: Mutex<Option<String>>,

    is_ready: AtomicBool,
    is_loaded: AtomicBool,
    is_loading: AtomicBool,
    is_open: AtomicBool,
    removed: AtomicBool,
    state_changed_at: Mutex<DateTime<Utc>>,

    when_ready: Deferred<ReadyPayload>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    listeners: Mutex<Vec<(&'static str, ListenerId)>>,
}

impl Panel {
    /// Create a panel, its frame, and its transport registration. The
    /// panel's event node is attached under the context root; owners may
    /// re-parent it.
    pub fn new(ctx: Arc<RuntimeContext>, panel_id: &str, options: PanelOptions) -> Arc<Panel> {
        let events = EventNode::new(format!("panel:{}", panel_id));
        events.set_parent(Some(&ctx.events));

        let title = options.title.clone();
        let panel = Arc::new(Panel {
            ctx,
            panel_id: panel_id.to_string(),
            events,
            options: Mutex::new(options),
            frame: Mutex::new(None),
            channel: Mutex::new(None),
            location: Mutex::new(None),
            status_code: Mutex::new(None),
            title: Mutex::new(title),
            is_ready: AtomicBool::new(false),
            is_loaded: AtomicBool::new(false),
            is_loading: AtomicBool::new(false),
            is_open: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            state_changed_at: Mutex::new(Utc::now()),
            when_ready: Deferred::new(),
            watchdog: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        });

        panel.attach_frame(None);
        panel.wire_listeners();
        tracing::debug!("Panel created: {}", panel_id);
        panel
    }

    pub fn panel_id(&self) -> &str {
        &self.panel_id
    }

    pub fn events(&self) -> &Arc<EventNode> {
        &self.events
    }

    /// The channel inbound frame messages arrive on. Embedders pump their
    /// message events through this.
    pub fn window_channel(&self) -> Option<WindowChannel> {
        self.channel.lock().unwrap().clone()
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded.load(Ordering::SeqCst)
    }

    pub fn location(&self) -> Option<String> {
        self.location.lock().unwrap().clone()
    }

    pub fn title(&self) -> Option<String> {
        self.title.lock().unwrap().clone()
    }

    pub fn set_title(&self, title: Option<String>) {
        *self.title.lock().unwrap() = title.clone();
        self.options.lock().unwrap().title = title;
    }

    pub fn options(&self) -> PanelOptions {
        self.options.lock().unwrap().clone()
    }

    /// Open the panel. Requires an authorized session; the `open` event may
    /// veto or redirect the request.
    pub async fn open(
        self: &Arc<Self>,
        destination: Option<&str>,
        no_history: bool,
    ) -> Result<(), BridgeError> {
        self.guard_not_removed()?;
        if !self.ctx.auth.is_authorized() {
            return Err(BridgeError::Unauthorized(format!(
                "panel '{}' cannot open without an authorized user",
                self.panel_id
            )));
        }

        let data = self.events.trigger(
            "open",
            json!({ "panel_id": self.panel_id, "destination": destination }),
        )?;
        let destination = data["destination"].as_str().map(str::to_string);

        self.is_open.store(true, Ordering::SeqCst);
        self.touch();
        tracing::info!("Panel opened: {}", self.panel_id);

        let shown = if destination.is_none() && self.is_ready() {
            // already loaded, just bring it to front
            let show = WireMessage::new(names::SHOW, &self.ctx.group_id);
            self.ctx
                .broker
                .send(&self.panel_id, &self.ctx.group_id, show)
                .await
                .map(|_| ())
        } else {
            let target = destination.or_else(|| self.location());
            self.load_internal(target.as_deref(), None, "GET", false)
                .await
        };
        if let Err(e) = shown {
            self.is_open.store(false, Ordering::SeqCst);
            return Err(e);
        }

        if !no_history {
            self.record_history();
        }
        Ok(())
    }

    /// Close the panel. Idempotent: a second close resolves immediately
    /// without a second event or history entry.
    pub async fn close(&self, no_history: bool, no_event: bool) -> Result<(), BridgeError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.touch();
        tracing::info!("Panel closed: {}", self.panel_id);

        if !no_event {
            let _ = self
                .events
                .trigger("close", json!({ "panel_id": self.panel_id }));
        }

        // give the frame's own teardown a bounded grace period
        if self.is_ready() {
            let close = WireMessage::new(names::CLOSE, &self.ctx.group_id);
            let send = self.ctx.broker.send(&self.panel_id, &self.ctx.group_id, close);
            let _ = tokio::time::timeout(self.ctx.config.timeouts.close_grace(), send).await;
        }

        if !no_history {
            self.record_history();
        }
        Ok(())
    }

    /// Load content. Ready panels navigate in place over the message
    /// channel; everything else goes through the frame's source attribute
    /// (GET) or a same-target form submission (other methods).
    pub async fn load(
        self: &Arc<Self>,
        url: Option<&str>,
        data: Option<Value>,
        method: Option<&str>,
        replace: bool,
        no_history: bool,
    ) -> Result<(), BridgeError> {
        self.guard_not_removed()?;
        self.load_internal(url, data, method.unwrap_or("GET"), replace)
            .await?;
        if !no_history {
            self.record_history();
        }
        Ok(())
    }

    async fn load_internal(
        self: &Arc<Self>,
        url: Option<&str>,
        data: Option<Value>,
        method: &str,
        replace: bool,
    ) -> Result<(), BridgeError> {
        let resolved = match url {
            Some(url) => Some(self.resolve_url(url)?),
            None => None,
        };

        if self.is_ready() {
            self.begin_loading();
            let target = resolved
                .or_else(|| self.location())
                .ok_or_else(|| BridgeError::Config(format!("panel '{}' has no destination", self.panel_id)))?;
            let visit = VisitPayload {
                url: target,
                method: method.to_string(),
                data,
                action: if replace { "replace" } else { "advance" }.to_string(),
            };
            let mut message = WireMessage::new(names::TURBO_VISIT, &self.ctx.group_id);
            if let Ok(Value::Object(payload)) = serde_json::to_value(&visit) {
                message.payload = payload;
            }
            self.ctx
                .broker
                .send(&self.panel_id, &self.ctx.group_id, message)
                .await?;
        } else {
            let frame = self
                .frame
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| BridgeError::NotConnected(self.panel_id.clone()))?;
            match resolved.or_else(|| self.location()) {
                Some(target) => {
                    self.begin_loading();
                    if method.eq_ignore_ascii_case("GET") {
                        frame.navigate(&target)?;
                    } else {
                        frame.submit(&target, method, &data.unwrap_or(Value::Null))?;
                    }
                }
                None => {
                    // nothing to navigate to; the frame keeps its current
                    // content and readiness will arrive from its initial src
                    tracing::debug!("Panel '{}' opened without a destination", self.panel_id);
                }
            }
        }
        Ok(())
    }

    /// Force a content refresh. A ready frame is told to refresh itself;
    /// anything else re-navigates to the current location.
    pub async fn reload(self: &Arc<Self>) -> Result<(), BridgeError> {
        self.guard_not_removed()?;
        if self.is_ready() {
            self.begin_loading();
            let message = WireMessage::new(names::RELOAD, &self.ctx.group_id);
            self.ctx
                .broker
                .send(&self.panel_id, &self.ctx.group_id, message)
                .await?;
            Ok(())
        } else {
            self.load_internal(None, None, "GET", true).await
        }
    }

    /// Discard the current frame and start over with a fresh one pointed at
    /// the same source. Open panels reload afterwards.
    pub async fn reset(self: &Arc<Self>) -> Result<(), BridgeError> {
        self.guard_not_removed()?;
        tracing::info!("Panel reset: {}", self.panel_id);
        self.cancel_watchdog();
        let was_open = self.is_open();

        self.ctx.broker.unregister(&self.panel_id, &self.ctx.group_id);
        if let Some(frame) = self.frame.lock().unwrap().take() {
            frame.detach();
        }
        self.channel.lock().unwrap().take();

        self.is_ready.store(false, Ordering::SeqCst);
        self.is_loaded.store(false, Ordering::SeqCst);
        self.is_loading.store(false, Ordering::SeqCst);
        self.when_ready.reset();

        let src = self.location();
        // an open panel reloads explicitly below; seeding the fresh frame
        // with src as well would navigate it twice
        if was_open {
            self.attach_frame(None);
        } else {
            self.attach_frame(src.as_deref());
        }
        self.touch();
        let _ = self
            .events
            .trigger("reset", json!({ "panel_id": self.panel_id }));

        if was_open {
            self.load_internal(src.as_deref(), None, "GET", true).await?;
        }
        Ok(())
    }

    /// Send a message into the frame, once it is ready. Fails immediately
    /// with `NotConnected` when the frame is detached.
    pub async fn post_message(&self, message: WireMessage) -> Result<WireMessage, BridgeError> {
        let attached = self
            .frame
            .lock()
            .unwrap()
            .as_ref()
            .map(|frame| frame.is_attached())
            .unwrap_or(false);
        if !attached {
            return Err(BridgeError::NotConnected(self.panel_id.clone()));
        }

        self.when_ready.wait().await;
        self.ctx
            .broker
            .send(&self.panel_id, &self.ctx.group_id, message)
            .await
    }

    /// Push computed styling into the frame
    pub async fn apply_styles(&self, styles: StylesPayload) -> Result<(), BridgeError> {
        let mut message = WireMessage::new(names::STYLES, &self.ctx.group_id);
        if let Ok(Value::Object(payload)) = serde_json::to_value(&styles) {
            message.payload = payload;
        }
        self.post_message(message).await.map(|_| ())
    }

    /// Serialize the panel for history/deep-linking
    pub fn get_state(&self) -> PanelState {
        PanelState {
            panel_id: self.panel_id.clone(),
            is_open: self.is_open(),
            location: self.location(),
            status_code: *self.status_code.lock().unwrap(),
            title: self.title(),
            changed_at: *self.state_changed_at.lock().unwrap(),
        }
    }

    /// Restore a serialized state. Mismatched panel ids and error pages are
    /// rejected with a log line, not an error.
    pub async fn set_state(self: &Arc<Self>, state: &PanelState) -> bool {
        if state.panel_id != self.panel_id {
            tracing::warn!(
                "Ignoring state for panel '{}' offered to panel '{}'",
                state.panel_id,
                self.panel_id
            );
            return false;
        }
        if state.is_error_page() {
            tracing::warn!(
                "Ignoring error-page state for panel '{}' (status {:?})",
                self.panel_id,
                state.status_code
            );
            return false;
        }

        self.set_title(state.title.clone());
        if state.is_open {
            if let Err(e) = self.open(state.location.as_deref(), true).await {
                tracing::warn!("Failed to restore panel '{}': {}", self.panel_id, e);
                return false;
            }
        } else {
            let _ = self.close(true, false).await;
        }
        true
    }

    /// Terminal removal: force-close if open, tear down the registration
    /// and the frame
    pub async fn remove(self: &Arc<Self>) -> Result<(), BridgeError> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Panel removed: {}", self.panel_id);

        if self.is_open() {
            let _ = self.close(true, false).await;
        }
        self.cancel_watchdog();
        self.teardown();
        let _ = self
            .events
            .trigger("removed", json!({ "panel_id": self.panel_id }));
        Ok(())
    }

    fn teardown(&self) {
        self.ctx.broker.unregister(&self.panel_id, &self.ctx.group_id);
        for (name, id) in self.listeners.lock().unwrap().drain(..) {
            self.ctx.broker.remove_listener(name, id);
        }
        if let Some(frame) = self.frame.lock().unwrap().take() {
            frame.detach();
        }
        self.channel.lock().unwrap().take();
        self.is_ready.store(false, Ordering::SeqCst);
        self.when_ready.reset();
    }

    fn guard_not_removed(&self) -> Result<(), BridgeError> {
        if self.removed.load(Ordering::SeqCst) {
            Err(BridgeError::NotConnected(self.panel_id.clone()))
        } else {
            Ok(())
        }
    }

    fn attach_frame(self: &Arc<Self>, src: Option<&str>) {
        let frame = self.ctx.frames.create_frame(&self.panel_id, src);
        let channel = self.ctx.broker.register(
            frame.clone(),
            &self.panel_id,
            &self.ctx.group_id,
            &self.ctx.allowed_origin,
        );
        *self.frame.lock().unwrap() = Some(frame);
        *self.channel.lock().unwrap() = Some(channel);
    }

    fn wire_listeners(self: &Arc<Self>) {
        let mut listeners = self.listeners.lock().unwrap();

        let weak = Arc::downgrade(self);
        listeners.push((
            names::READY,
            self.ctx.broker.add_listener(
                names::READY,
                Arc::new(move |envelope: &InboundEnvelope| {
                    if let Some(panel) = weak.upgrade() {
                        if panel.is_mine(envelope) {
                            panel.on_ready(envelope);
                        }
                    }
                }),
            ),
        ));

        let weak = Arc::downgrade(self);
        listeners.push((
            names::UNREADY,
            self.ctx.broker.add_listener(
                names::UNREADY,
                Arc::new(move |envelope: &InboundEnvelope| {
                    if let Some(panel) = weak.upgrade() {
                        if panel.is_mine(envelope) {
                            panel.on_unready();
                        }
                    }
                }),
            ),
        ));

        let weak = Arc::downgrade(self);
        listeners.push((
            names::REQUEST_CLOSE,
            self.ctx.broker.add_listener(
                names::REQUEST_CLOSE,
                Arc::new(move |envelope: &InboundEnvelope| {
                    if let Some(panel) = weak.upgrade() {
                        if panel.is_mine(envelope) {
                            tokio::spawn(async move {
                                if let Err(e) = panel.close(false, false).await {
                                    tracing::warn!("Frame-requested close failed: {}", e);
                                }
                            });
                        }
                    }
                }),
            ),
        ));

        let weak = Arc::downgrade(self);
        listeners.push((
            names::REQUEST_RESET,
            self.ctx.broker.add_listener(
                names::REQUEST_RESET,
                Arc::new(move |envelope: &InboundEnvelope| {
                    if let Some(panel) = weak.upgrade() {
                        if panel.is_mine(envelope) {
                            tokio::spawn(async move {
                                if let Err(e) = panel.reset().await {
                                    tracing::warn!("Frame-requested reset failed: {}", e);
                                }
                            });
                        }
                    }
                }),
            ),
        ));
    }

    fn is_mine(&self, envelope: &InboundEnvelope) -> bool {
        envelope.group_id == self.ctx.group_id && envelope.window_name == self.panel_id
    }

    fn on_ready(&self, envelope: &InboundEnvelope) {
        let Some(payload) = ReadyPayload::from_message(&envelope.message) else {
            tracing::warn!("Malformed ready payload from panel '{}'", self.panel_id);
            return;
        };

        self.cancel_watchdog();
        self.is_ready.store(true, Ordering::SeqCst);
        self.is_loaded.store(true, Ordering::SeqCst);
        self.is_loading.store(false, Ordering::SeqCst);
        *self.location.lock().unwrap() = Some(payload.location.clone());
        *self.status_code.lock().unwrap() = Some(payload.status_code);
        if payload.title.is_some() {
            *self.title.lock().unwrap() = payload.title.clone();
        }
        self.touch();
        self.when_ready.resolve(payload.clone());
        tracing::debug!(
            "Panel ready: {} at {} ({})",
            self.panel_id,
            payload.location,
            payload.status_code
        );

        let _ = self.events.trigger(
            "ready",
            json!({
                "panel_id": self.panel_id,
                "location": payload.location,
                "status_code": payload.status_code,
            }),
        );
    }

    fn on_unready(&self) {
        self.is_ready.store(false, Ordering::SeqCst);
        self.is_loading.store(false, Ordering::SeqCst);
        self.when_ready.reset();
        self.touch();
        tracing::debug!("Panel unready: {}", self.panel_id);
        let _ = self
            .events
            .trigger("unready", json!({ "panel_id": self.panel_id }));
    }

    /// Mark the panel loading and arm the watchdog that clears a stuck
    /// loading indicator. The watchdog never marks the panel ready.
    fn begin_loading(self: &Arc<Self>) {
        self.is_loading.store(true, Ordering::SeqCst);
        self.cancel_watchdog();

        let weak = Arc::downgrade(self);
        let window = self.ctx.config.timeouts.loading_watchdog();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(panel) = weak.upgrade() {
                if panel.is_loading.swap(false, Ordering::SeqCst) {
                    tracing::warn!(
                        "Panel '{}' saw no ready within {:?}; clearing the loading indicator",
                        panel.panel_id,
                        window
                    );
                    let _ = panel.events.trigger(
                        "loading",
                        json!({ "panel_id": panel.panel_id, "is_loading": false, "timed_out": true }),
                    );
                }
            }
        });
        *self.watchdog.lock().unwrap() = Some(handle);
    }

    fn cancel_watchdog(&self) {
        if let Some(handle) = self.watchdog.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn resolve_url(&self, url: &str) -> Result<String, BridgeError> {
        let base = Url::parse(&self.ctx.config.environment_url)
            .map_err(|e| BridgeError::Config(format!("invalid environment url: {}", e)))?;
        let resolved = base
            .join(url)
            .map_err(|e| BridgeError::Config(format!("invalid url '{}': {}", url, e)))?;
        let resolved = resolved.to_string();

        if !self.ctx.is_allowed_origin(&resolved) {
            return Err(BridgeError::InvalidOrigin {
                window: self.panel_id.clone(),
                expected: self.ctx.allowed_origin.clone(),
                observed: common::origin_of(&resolved).unwrap_or_else(|_| resolved.clone()),
            });
        }
        Ok(resolved)
    }

    fn record_history(&self) {
        self.ctx.history.record(self.get_state());
    }

    fn touch(&self) {
        *self.state_changed_at.lock().unwrap() = Utc::now();
    }
}

impl Drop for Panel {
    fn drop(&mut self) {
        // registrations and listeners must not outlive the panel
        self.ctx.broker.unregister(&self.panel_id, &self.ctx.group_id);
        if let Ok(mut listeners) = self.listeners.lock() {
            for (name, id) in listeners.drain(..) {
                self.ctx.broker.remove_listener(name, id);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::auth::{Authentication, SsoEndpoint};
    use crate::frames::ChannelFrameFactory;
    use crate::history::{HistoryStore, MemoryHistoryBackend};
    use crate::transport::MessageBroker;
    use async_trait::async_trait;
    use common::{RuntimeConfig, User};
    use futures::FutureExt;

    pub struct StaticEndpoint(pub i64);

    #[async_trait]
    impl SsoEndpoint for StaticEndpoint {
        async fn resolve_user(&self, _bearer: Option<&str>) -> Result<User, BridgeError> {
            Ok(User::new(self.0))
        }
    }

    pub struct TestRig {
        pub ctx: Arc<RuntimeContext>,
        pub factory: Arc<ChannelFrameFactory>,
    }

    pub fn rig() -> TestRig {
        let mut config = RuntimeConfig::default();
        config.environment_url = "https://cdn.example".to_string();
        let config = Arc::new(config);

        let broker = MessageBroker::new(config.timeouts.receipt());
        let events = EventNode::new("environment");
        let auth = Authentication::new(Arc::new(StaticEndpoint(1)), EventNode::new("auth"));
        auth.events().set_parent(Some(&events));
        let factory = ChannelFrameFactory::new();
        let history = HistoryStore::new(MemoryHistoryBackend::new(), "https://cdn.example");

        let ctx = RuntimeContext::new(
            config,
            broker,
            auth,
            factory.clone(),
            history,
            events,
            "group-1",
        );
        TestRig { ctx, factory }
    }

    pub async fn authorize(ctx: &Arc<RuntimeContext>) {
        ctx.auth
            .set_token_factory(Arc::new(|_refresh| {
                async { Ok("token".to_string()) }.boxed()
            }));
        ctx.auth.check_user_state().await.expect("authorize");
        assert!(ctx.auth.is_authorized());
    }

    pub fn ready_message(ctx: &Arc<RuntimeContext>, location: &str) -> WireMessage {
        WireMessage::new(names::READY, &ctx.group_id)
            .with_field("location", Value::String(location.to_string()))
            .with_field("status_code", Value::from(200))
    }
}
