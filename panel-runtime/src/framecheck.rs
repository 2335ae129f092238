// panel-runtime/src/framecheck.rs
//
// Frame-blockage diagnostics. Some embedding contexts silently refuse
// cross-origin frames (CSP, X-Frame-Options, blocked third-party storage);
// every panel would then time out individually with no explanation. The
// frame check loads one tiny probe frame against the environment's status
// endpoint and reports the outcome as a single boolean `frame-check` event
// that UI layers can turn into a banner.

use crate::context::RuntimeContext;
use crate::deferred::Deferred;
use crate::transport::{InboundEnvelope, ListenerId};
use common::{names, WireMessage};
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};

const PROBE_NAME: &str = "frame-check";

pub struct FrameCheck {
    ctx: Arc<RuntimeContext>,
    outcome: Deferred<bool>,
    listener: Mutex<Option<ListenerId>>,
}

impl FrameCheck {
    pub fn new(ctx: Arc<RuntimeContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            outcome: Deferred::new(),
            listener: Mutex::new(None),
        })
    }

    /// The probe's verdict so far; `None` until a check has completed
    pub fn verdict(&self) -> Option<bool> {
        self.outcome.peek()
    }

    /// Run the probe once and report whether frame communication works.
    /// Repeated calls return the first verdict.
    pub async fn run(self: &Arc<Self>) -> bool {
        if let Some(ok) = self.outcome.peek() {
            return ok;
        }

        let src = format!(
            "{}/ping",
            self.ctx.config.environment_url.trim_end_matches('/')
        );
        let frame = self.ctx.frames.create_frame(PROBE_NAME, Some(&src));
        self.ctx.broker.register(
            frame.clone(),
            PROBE_NAME,
            &self.ctx.group_id,
            &self.ctx.allowed_origin,
        );

        // prompt the frame; a live frame answers with ready
        let ping =
            WireMessage::new(names::PING, &self.ctx.group_id).with_window(PROBE_NAME);
        if let Err(e) = frame.post(ping) {
            tracing::debug!("Frame-check ping not delivered: {}", e);
        }

        let weak: Weak<FrameCheck> = Arc::downgrade(self);
        let listener = self.ctx.broker.add_listener(
            names::READY,
            Arc::new(move |envelope: &InboundEnvelope| {
                if envelope.window_name == PROBE_NAME {
                    if let Some(check) = weak.upgrade() {
                        check.outcome.resolve(true);
                    }
                }
            }),
        );
        *self.listener.lock().unwrap() = Some(listener);

        // a silent probe within the receipt window means the frame is blocked
        let ok = tokio::time::timeout(self.ctx.config.timeouts.receipt(), self.outcome.wait())
            .await
            .unwrap_or(false);
        self.outcome.resolve(ok);

        if let Some(listener) = self.listener.lock().unwrap().take() {
            self.ctx.broker.remove_listener(names::READY, listener);
        }
        self.ctx.broker.unregister(PROBE_NAME, &self.ctx.group_id);
        frame.detach();

        if ok {
            tracing::debug!("Frame check passed for {}", self.ctx.allowed_origin);
        } else {
            tracing::warn!(
                "Frame check failed for {}: probe frame never became ready",
                self.ctx.allowed_origin
            );
        }
        let _ = self
            .ctx
            .events
            .trigger("frame-check", json!({ "ok": ok }));
        ok
    }

    /// The probe's inbound channel name, for embedders pumping messages
    pub fn probe_name() -> &'static str {
        PROBE_NAME
    }
}
