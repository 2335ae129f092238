// panel-runtime/src/frames.rs
use common::{BridgeError, WireMessage};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A sandboxed rendering context owned by a panel. Browsers, hidden forms
/// and iframes live behind this seam; the runtime only ever posts messages,
/// points the frame at a URL, or detaches it.
pub trait FrameWindow: Send + Sync {
    /// Deliver a message into the frame
    fn post(&self, message: WireMessage) -> Result<(), BridgeError>;

    /// Point the frame at a URL (GET navigation via the source attribute)
    fn navigate(&self, url: &str) -> Result<(), BridgeError>;

    /// Submit a same-target form, for method/body semantics a source
    /// attribute cannot carry
    fn submit(&self, url: &str, method: &str, body: &Value) -> Result<(), BridgeError>;

    /// Whether the frame is attached to a rendering surface
    fn is_attached(&self) -> bool;

    /// Detach the frame; a detached frame drops everything posted to it
    fn detach(&self);
}

/// Creates frames on demand; panels recreate their frame on reset through
/// the same factory that built the original.
pub trait FrameFactory: Send + Sync {
    fn create_frame(&self, panel_id: &str, src: Option<&str>) -> Arc<dyn FrameWindow>;
}

/// What a [`ChannelFrame`] was asked to do, observable on the paired receiver
#[derive(Debug, Clone)]
pub enum FrameCommand {
    Post(WireMessage),
    Navigate(String),
    Submit {
        url: String,
        method: String,
        body: Value,
    },
    Detach,
}

/// Channel-backed frame: the headless implementation used by tests and by
/// embedders that pump frame traffic through their own transport.
pub struct ChannelFrame {
    label: String,
    tx: mpsc::UnboundedSender<FrameCommand>,
    attached: AtomicBool,
    last_navigation: Mutex<Option<String>>,
}

impl ChannelFrame {
    /// Create a frame plus the receiver observing everything posted into it
    pub fn channel(label: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<FrameCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let frame = Arc::new(Self {
            label: label.into(),
            tx,
            attached: AtomicBool::new(true),
            last_navigation: Mutex::new(None),
        });
        (frame, rx)
    }

    /// The URL the frame was last pointed at
    pub fn last_navigation(&self) -> Option<String> {
        self.last_navigation.lock().unwrap().clone()
    }

    fn guard_attached(&self) -> Result<(), BridgeError> {
        if self.attached.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::NotConnected(self.label.clone()))
        }
    }
}

impl FrameWindow for ChannelFrame {
    fn post(&self, message: WireMessage) -> Result<(), BridgeError> {
        self.guard_attached()?;
        self.tx
            .send(FrameCommand::Post(message))
            .map_err(|_| BridgeError::NotConnected(self.label.clone()))
    }

    fn navigate(&self, url: &str) -> Result<(), BridgeError> {
        self.guard_attached()?;
        *self.last_navigation.lock().unwrap() = Some(url.to_string());
        self.tx
            .send(FrameCommand::Navigate(url.to_string()))
            .map_err(|_| BridgeError::NotConnected(self.label.clone()))
    }

    fn submit(&self, url: &str, method: &str, body: &Value) -> Result<(), BridgeError> {
        self.guard_attached()?;
        *self.last_navigation.lock().unwrap() = Some(url.to_string());
        self.tx
            .send(FrameCommand::Submit {
                url: url.to_string(),
                method: method.to_string(),
                body: body.clone(),
            })
            .map_err(|_| BridgeError::NotConnected(self.label.clone()))
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn detach(&self) {
        if !self.attached.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(FrameCommand::Detach);
        tracing::debug!("Frame detached: {}", self.label);
    }
}

/// Factory producing [`ChannelFrame`]s and retaining the receiver side for
/// the embedder to drain
pub struct ChannelFrameFactory {
    created: Mutex<Vec<(String, mpsc::UnboundedReceiver<FrameCommand>)>>,
}

impl ChannelFrameFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
        })
    }

    /// Take the receiver paired with the most recently created frame for a
    /// panel id
    pub fn take_receiver(&self, panel_id: &str) -> Option<mpsc::UnboundedReceiver<FrameCommand>> {
        let mut created = self.created.lock().unwrap();
        let index = created.iter().rposition(|(id, _)| id == panel_id)?;
        Some(created.remove(index).1)
    }
}

impl FrameFactory for ChannelFrameFactory {
    fn create_frame(&self, panel_id: &str, src: Option<&str>) -> Arc<dyn FrameWindow> {
        let (frame, rx) = ChannelFrame::channel(panel_id);
        if let Some(src) = src {
            // initial source assignment happens before the panel loads
            let _ = frame.navigate(src);
        }
        self.created.lock().unwrap().push((panel_id.to_string(), rx));
        frame
    }
}
