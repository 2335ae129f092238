// panel-runtime/src/transport.rs
//
// Process-wide origin-validated message broker. Content windows register
// under a logical name scoped by group id; every outbound message is
// correlated with its receipt by a generated id, and every inbound message
// is acknowledged automatically unless acknowledgement is impossible
// (receipts themselves, and `unready` teardown signals whose source context
// may already be gone).

use crate::frames::FrameWindow;
use common::{names, BridgeError, WireMessage};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// An inbound message together with where it came from
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    pub group_id: String,
    pub window_name: String,
    pub origin: String,
    pub message: WireMessage,
}

pub type MessageListener = Arc<dyn Fn(&InboundEnvelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct WindowEntry {
    handle: Arc<dyn FrameWindow>,
    allowed_origin: String,
    /// Latched from the frame's `ready` message; authorizes sends
    observed_origin: Option<String>,
}

/// The transport layer: a shared registry of content windows plus the
/// receipt correlation table
pub struct MessageBroker {
    windows: DashMap<(String, String), WindowEntry>,
    pending: DashMap<Uuid, oneshot::Sender<WireMessage>>,
    listeners: DashMap<String, Vec<(u64, MessageListener)>>,
    next_listener: AtomicU64,
    receipt_timeout: Duration,
}

impl MessageBroker {
    pub fn new(receipt_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            windows: DashMap::new(),
            pending: DashMap::new(),
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(1),
            receipt_timeout,
        })
    }

    /// Register a content window under a logical name. Idempotent per
    /// (name, group): re-registration replaces the previous handle and
    /// clears its latched origin. Returns the channel inbound messages from
    /// this window arrive on.
    pub fn register(
        self: &Arc<Self>,
        handle: Arc<dyn FrameWindow>,
        logical_name: &str,
        group_id: &str,
        allowed_origin: &str,
    ) -> WindowChannel {
        let key = (group_id.to_string(), logical_name.to_string());
        let replaced = self
            .windows
            .insert(
                key,
                WindowEntry {
                    handle,
                    allowed_origin: allowed_origin.to_string(),
                    observed_origin: None,
                },
            )
            .is_some();

        if replaced {
            tracing::debug!("Window re-registered: {} ({})", logical_name, group_id);
        } else {
            tracing::debug!("Window registered: {} ({})", logical_name, group_id);
        }

        WindowChannel {
            broker: Arc::downgrade(self),
            group_id: group_id.to_string(),
            name: logical_name.to_string(),
        }
    }

    /// Remove a registration. Safe to call on unknown names.
    pub fn unregister(&self, logical_name: &str, group_id: &str) {
        let key = (group_id.to_string(), logical_name.to_string());
        if self.windows.remove(&key).is_some() {
            tracing::debug!("Window unregistered: {} ({})", logical_name, group_id);
        }
    }

    pub fn is_registered(&self, logical_name: &str, group_id: &str) -> bool {
        self.windows
            .contains_key(&(group_id.to_string(), logical_name.to_string()))
    }

    /// Send a message to a registered window and wait for its receipt.
    ///
    /// Fails synchronously with `NotRegistered` for unknown targets and
    /// `InvalidOrigin` when the window's latched ready-origin does not match
    /// its registered origin; fails with `Timeout` when no receipt arrives
    /// within the configured window.
    pub async fn send(
        &self,
        logical_name: &str,
        group_id: &str,
        mut message: WireMessage,
    ) -> Result<WireMessage, BridgeError> {
        let key = (group_id.to_string(), logical_name.to_string());
        let handle = {
            let entry = self
                .windows
                .get(&key)
                .ok_or_else(|| BridgeError::NotRegistered(logical_name.to_string()))?;

            match entry.observed_origin.as_deref() {
                Some(origin) if origin == entry.allowed_origin => {}
                other => {
                    return Err(BridgeError::InvalidOrigin {
                        window: logical_name.to_string(),
                        expected: entry.allowed_origin.clone(),
                        observed: other.unwrap_or("(none)").to_string(),
                    });
                }
            }
            entry.handle.clone()
        };

        let message_id = *message.message_id.get_or_insert_with(Uuid::new_v4);
        message.window_name = Some(logical_name.to_string());

        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id, tx);
        // callers may abandon the send (a shorter outer timeout, a dropped
        // task); the guard removes the waiter however this future ends
        let _guard = PendingGuard {
            pending: &self.pending,
            id: message_id,
        };

        handle.post(message)?;

        match tokio::time::timeout(self.receipt_timeout, rx).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(_)) | Err(_) => {
                Err(BridgeError::Timeout(self.receipt_timeout.as_millis() as u64))
            }
        }
    }

    /// Fire-and-forget delivery to every registered window whose latched
    /// origin matches its registered origin. Mismatches are skipped
    /// silently.
    pub fn broadcast(&self, message: &WireMessage) {
        for entry in self.windows.iter() {
            let window = entry.value();
            match window.observed_origin.as_deref() {
                Some(origin) if origin == window.allowed_origin => {
                    let (group_id, name) = entry.key();
                    let mut copy = message.clone();
                    copy.group_id = group_id.clone();
                    copy.window_name = Some(name.clone());
                    if let Err(e) = window.handle.post(copy) {
                        tracing::debug!("Broadcast skipped dead window '{}': {}", name, e);
                    }
                }
                _ => {
                    tracing::debug!("Broadcast skipped unconfirmed window '{}'", entry.key().1);
                }
            }
        }
    }

    /// Subscribe to inbound messages by name
    pub fn add_listener(&self, name: &str, listener: MessageListener) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(name.to_string())
            .or_default()
            .push((id, listener));
        ListenerId(id)
    }

    pub fn remove_listener(&self, name: &str, id: ListenerId) {
        if let Some(mut entry) = self.listeners.get_mut(name) {
            entry.retain(|(listener_id, _)| *listener_id != id.0);
        }
    }

    /// Inbound path for one message arriving from a registered window
    fn handle_incoming(&self, group_id: &str, window_name: &str, origin: &str, mut message: WireMessage) {
        if message.name.is_empty() {
            return;
        }
        if message.group_id != group_id {
            tracing::warn!(
                "Dropping message '{}' from '{}': group mismatch ({} != {})",
                message.name,
                window_name,
                message.group_id,
                group_id
            );
            return;
        }

        // source identity comes from the channel the message arrived on
        message.window_name = Some(window_name.to_string());

        // receipts only resolve their pending send; a mismatched id must not
        // resolve anything
        if message.name == names::RECEIPT {
            if let Some(id) = message.message_id {
                if let Some((_, waiter)) = self.pending.remove(&id) {
                    let _ = waiter.send(message);
                } else {
                    tracing::debug!("Receipt for unknown message id {}", id);
                }
            }
            return;
        }

        let key = (group_id.to_string(), window_name.to_string());

        if message.name == names::READY {
            // latch the observed origin as the trusted origin for this window
            if let Some(mut entry) = self.windows.get_mut(&key) {
                entry.observed_origin = Some(origin.to_string());
                tracing::debug!("Window '{}' ready from origin {}", window_name, origin);
            }
        }

        if message.name == names::REGISTER_CHILD {
            // assign the logical name the window was registered under
            if let Some(entry) = self.windows.get(&key) {
                let reply = WireMessage::new(names::REGISTER_WINDOW, group_id)
                    .with_window(window_name);
                if let Err(e) = entry.handle.post(reply) {
                    tracing::warn!("Failed to assign window name to '{}': {}", window_name, e);
                }
            }
        }

        // acknowledge everything that can be acknowledged
        if message.expects_receipt() {
            if let Some(entry) = self.windows.get(&key) {
                if let Some(receipt) = message.receipt() {
                    if let Err(e) = entry.handle.post(receipt) {
                        tracing::debug!("Could not acknowledge '{}': {}", message.name, e);
                    }
                }
            }
        }

        let envelope = InboundEnvelope {
            group_id: group_id.to_string(),
            window_name: window_name.to_string(),
            origin: origin.to_string(),
            message,
        };

        let matching: Vec<MessageListener> = self
            .listeners
            .get(&envelope.message.name)
            .map(|entry| entry.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in matching {
            listener(&envelope);
        }
    }
}

/// Clears a send's correlation entry on drop, so an abandoned send cannot
/// leave its waiter behind
struct PendingGuard<'a> {
    pending: &'a DashMap<Uuid, oneshot::Sender<WireMessage>>,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// The inbound half of a registration: messages from one content window
/// enter the broker through its channel, which fixes their source identity.
#[derive(Clone)]
pub struct WindowChannel {
    broker: Weak<MessageBroker>,
    group_id: String,
    name: String,
}

impl WindowChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver a message that arrived from this window with the given
    /// observed origin
    pub fn deliver(&self, origin: &str, message: WireMessage) {
        if let Some(broker) = self.broker.upgrade() {
            broker.handle_incoming(&self.group_id, &self.name, origin, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{ChannelFrame, FrameCommand};
    use serde_json::Value;

    const GROUP: &str = "group-1";
    const ORIGIN: &str = "https://cdn.example";

    fn ready_message() -> WireMessage {
        WireMessage::new(names::READY, GROUP)
            .with_field("location", Value::String(format!("{}/app", ORIGIN)))
            .with_field("status_code", Value::from(200))
    }

    #[tokio::test]
    async fn send_to_unregistered_window_fails_synchronously() {
        let broker = MessageBroker::new(Duration::from_millis(2000));
        let result = broker
            .send("nobody", GROUP, WireMessage::new("show", GROUP))
            .await;
        assert!(matches!(result, Err(BridgeError::NotRegistered(_))));
    }

    #[tokio::test]
    async fn send_before_ready_is_an_origin_failure() {
        let broker = MessageBroker::new(Duration::from_millis(2000));
        let (frame, _rx) = ChannelFrame::channel("panel-1");
        broker.register(frame, "panel-1", GROUP, ORIGIN);

        let result = broker
            .send("panel-1", GROUP, WireMessage::new("show", GROUP))
            .await;
        assert!(matches!(result, Err(BridgeError::InvalidOrigin { .. })));
    }

    #[tokio::test]
    async fn ready_from_wrong_origin_poisons_sends() {
        let broker = MessageBroker::new(Duration::from_millis(2000));
        let (frame, _rx) = ChannelFrame::channel("panel-1");
        let channel = broker.register(frame, "panel-1", GROUP, ORIGIN);

        channel.deliver("https://evil.example", ready_message());

        let result = broker
            .send("panel-1", GROUP, WireMessage::new("show", GROUP))
            .await;
        match result {
            Err(BridgeError::InvalidOrigin { expected, observed, .. }) => {
                assert_eq!(expected, ORIGIN);
                assert_eq!(observed, "https://evil.example");
            }
            other => panic!("expected InvalidOrigin, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn receipt_resolves_matching_send_only() {
        let broker = MessageBroker::new(Duration::from_millis(2000));
        let (frame, mut rx) = ChannelFrame::channel("panel-1");
        let channel = broker.register(frame, "panel-1", GROUP, ORIGIN);
        channel.deliver(ORIGIN, ready_message());

        let send = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .send("panel-1", GROUP, WireMessage::new("show", GROUP))
                    .await
            })
        };

        // wait for the posted message to observe its id
        let posted = loop {
            match rx.recv().await.expect("frame closed") {
                FrameCommand::Post(msg) if msg.name == "show" => break msg,
                _ => continue,
            }
        };
        let id = posted.message_id.expect("send assigns an id");

        // a receipt with a different id must not resolve the send
        channel.deliver(
            ORIGIN,
            WireMessage::new(names::RECEIPT, GROUP).with_id(Uuid::new_v4()),
        );
        assert!(!send.is_finished());

        channel.deliver(ORIGIN, WireMessage::new(names::RECEIPT, GROUP).with_id(id));
        let receipt = send.await.unwrap().unwrap();
        assert_eq!(receipt.message_id, Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_window_times_out_after_configured_window() {
        let broker = MessageBroker::new(Duration::from_millis(2000));
        let (frame, _rx) = ChannelFrame::channel("panel-1");
        let channel = broker.register(frame, "panel-1", GROUP, ORIGIN);
        channel.deliver(ORIGIN, ready_message());

        let started = tokio::time::Instant::now();
        let result = broker
            .send("panel-1", GROUP, WireMessage::new("show", GROUP))
            .await;

        assert!(matches!(result, Err(BridgeError::Timeout(2000))));
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_send_cleans_up_its_receipt_waiter() {
        let broker = MessageBroker::new(Duration::from_millis(2000));
        let (frame, _rx) = ChannelFrame::channel("panel-1");
        let channel = broker.register(frame, "panel-1", GROUP, ORIGIN);
        channel.deliver(ORIGIN, ready_message());

        // a caller giving up before the receipt window elapses drops the
        // send future mid-wait
        let result = tokio::time::timeout(
            Duration::from_millis(250),
            broker.send("panel-1", GROUP, WireMessage::new("close", GROUP)),
        )
        .await;
        assert!(result.is_err());
        assert!(broker.pending.is_empty());

        // and the correlation table stays clean long after
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(broker.pending.is_empty());
    }

    #[tokio::test]
    async fn inbound_messages_are_acknowledged_and_dispatched() {
        let broker = MessageBroker::new(Duration::from_millis(2000));
        let (frame, mut rx) = ChannelFrame::channel("panel-1");
        let channel = broker.register(frame, "panel-1", GROUP, ORIGIN);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            broker.add_listener(
                names::REQUEST_CLOSE,
                Arc::new(move |envelope: &InboundEnvelope| {
                    seen.lock().unwrap().push(envelope.window_name.clone());
                }),
            );
        }

        let id = Uuid::new_v4();
        channel.deliver(
            ORIGIN,
            WireMessage::new(names::REQUEST_CLOSE, GROUP).with_id(id),
        );

        // the broker must have auto-replied with a receipt for that id
        let receipt = match rx.recv().await.expect("frame closed") {
            FrameCommand::Post(msg) => msg,
            other => panic!("expected receipt, got {:?}", other),
        };
        assert_eq!(receipt.name, names::RECEIPT);
        assert_eq!(receipt.message_id, Some(id));

        assert_eq!(*seen.lock().unwrap(), vec!["panel-1".to_string()]);
    }

    #[tokio::test]
    async fn unready_is_never_acknowledged() {
        let broker = MessageBroker::new(Duration::from_millis(2000));
        let (frame, mut rx) = ChannelFrame::channel("panel-1");
        let channel = broker.register(frame, "panel-1", GROUP, ORIGIN);

        channel.deliver(
            ORIGIN,
            WireMessage::new(names::UNREADY, GROUP).with_id(Uuid::new_v4()),
        );

        // nothing may have been posted back into the frame
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_skips_origin_mismatches() {
        let broker = MessageBroker::new(Duration::from_millis(2000));

        let (trusted, mut trusted_rx) = ChannelFrame::channel("trusted");
        let trusted_channel = broker.register(trusted, "trusted", GROUP, ORIGIN);
        trusted_channel.deliver(ORIGIN, ready_message());

        let (hostile, mut hostile_rx) = ChannelFrame::channel("hostile");
        let hostile_channel = broker.register(hostile, "hostile", GROUP, ORIGIN);
        hostile_channel.deliver("https://evil.example", ready_message());

        broker.broadcast(&WireMessage::new(names::STYLES, GROUP));

        match trusted_rx.try_recv() {
            Ok(FrameCommand::Post(msg)) => assert_eq!(msg.name, names::STYLES),
            other => panic!("expected styles broadcast, got {:?}", other),
        }
        assert!(hostile_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn register_child_is_answered_with_the_logical_name() {
        let broker = MessageBroker::new(Duration::from_millis(2000));
        let (frame, mut rx) = ChannelFrame::channel("panel-1");
        let channel = broker.register(frame, "panel-1", GROUP, ORIGIN);

        channel.deliver(ORIGIN, WireMessage::new(names::REGISTER_CHILD, GROUP));

        let reply = match rx.recv().await.expect("frame closed") {
            FrameCommand::Post(msg) => msg,
            other => panic!("expected register-window, got {:?}", other),
        };
        assert_eq!(reply.name, names::REGISTER_WINDOW);
        assert_eq!(reply.window_name.as_deref(), Some("panel-1"));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let broker = MessageBroker::new(Duration::from_millis(2000));
        let (frame, _rx) = ChannelFrame::channel("panel-1");
        broker.register(frame, "panel-1", GROUP, ORIGIN);

        broker.unregister("panel-1", GROUP);
        broker.unregister("panel-1", GROUP);
        broker.unregister("never-registered", GROUP);
        assert!(!broker.is_registered("panel-1", GROUP));
    }
}
