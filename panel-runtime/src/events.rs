// panel-runtime/src/events.rs
//
// Phased event bus. Every named event runs three ordered phases:
// `before:name` from the root ancestor down to the triggering node,
// the bare name from the triggering node up to the root, and
// `after:name` from the root back down to the node. Any handler can
// transform the event data for subsequent stages or cancel the whole cycle.

use common::BridgeError;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// What a handler did with the event
pub enum EventOutcome {
    /// Keep the current data and continue
    Continue,
    /// Replace the data for all subsequent handlers and phases
    Transform(Value),
    /// Abort the remaining stages; the trigger resolves to `Cancelled`
    Cancel,
}

pub type EventHandler = Arc<dyn Fn(&Value) -> EventOutcome + Send + Sync>;

/// Opaque subscription handle. Rust closures have no comparable identity,
/// so removal goes through the id returned at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: u64,
    name: String,
    selector: Option<Value>,
    handler: EventHandler,
    once: bool,
}

/// One node in the event tree. Nodes link upward through a reassignable
/// parent reference; the chain is used purely for event propagation, not
/// memory ownership.
pub struct EventNode {
    label: String,
    parent: Mutex<Option<Arc<EventNode>>>,
    handlers: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventNode {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            parent: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Attach this node under a parent. A node has exactly one parent at a
    /// time; passing `None` detaches it. Attaching a node to one of its own
    /// descendants is refused.
    pub fn set_parent(self: &Arc<Self>, parent: Option<&Arc<EventNode>>) {
        if let Some(parent) = parent {
            // refuse cycles
            let mut cursor = Some(parent.clone());
            while let Some(node) = cursor {
                if Arc::ptr_eq(&node, self) {
                    tracing::warn!(
                        "Refusing to attach event node '{}' under its own descendant '{}'",
                        self.label,
                        parent.label
                    );
                    return;
                }
                cursor = node.parent.lock().unwrap().clone();
            }
            *self.parent.lock().unwrap() = Some(parent.clone());
        } else {
            *self.parent.lock().unwrap() = None;
        }
    }

    /// Subscribe a handler to a named event. The optional selector restricts
    /// delivery to events whose data carries every declared key with an
    /// equal value.
    pub fn on<F>(&self, name: &str, selector: Option<Value>, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> EventOutcome + Send + Sync + 'static,
    {
        self.register(name, selector, Arc::new(handler), false)
    }

    /// Subscribe to several names at once with a shared handler
    pub fn on_many<F>(&self, names: &[&str], selector: Option<Value>, handler: F) -> Vec<HandlerId>
    where
        F: Fn(&Value) -> EventOutcome + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        names
            .iter()
            .map(|name| self.register(name, selector.clone(), handler.clone(), false))
            .collect()
    }

    /// Subscribe a handler that auto-unsubscribes after its first invocation
    pub fn one<F>(&self, name: &str, selector: Option<Value>, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> EventOutcome + Send + Sync + 'static,
    {
        self.register(name, selector, Arc::new(handler), true)
    }

    fn register(
        &self,
        name: &str,
        selector: Option<Value>,
        handler: EventHandler,
        once: bool,
    ) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().unwrap().push(Registration {
            id,
            name: name.to_string(),
            selector,
            handler,
            once,
        });
        HandlerId(id)
    }

    /// Remove a subscription. Safe to call twice.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        let before = handlers.len();
        handlers.retain(|reg| reg.id != id.0);
        handlers.len() != before
    }

    /// Run the full phase cycle for `name` from this node. A name that
    /// already carries a phase prefix runs a single bubbling pass instead.
    ///
    /// Returns the (possibly transformed) data, or `Cancelled` if any
    /// handler vetoed the event.
    pub fn trigger(self: &Arc<Self>, name: &str, data: Value) -> Result<Value, BridgeError> {
        let chain = self.ancestor_chain();

        if name.starts_with("before:") || name.starts_with("after:") {
            // explicit phase: single pass, node to root
            return deliver_along(&chain, name, data).map_err(|_| cancelled(name));
        }

        let mut data = data;
        let root_to_node: Vec<_> = chain.iter().rev().cloned().collect();

        // before: root down to the triggering node
        data = deliver_along(&root_to_node, &format!("before:{}", name), data)
            .map_err(|_| cancelled(name))?;
        // on: triggering node up to the root
        data = deliver_along(&chain, name, data).map_err(|_| cancelled(name))?;
        // after: root back down to the node
        data = deliver_along(&root_to_node, &format!("after:{}", name), data)
            .map_err(|_| cancelled(name))?;

        Ok(data)
    }

    /// The chain [self, parent, ..., root]
    fn ancestor_chain(self: &Arc<Self>) -> Vec<Arc<EventNode>> {
        let mut chain = vec![self.clone()];
        let mut cursor = self.parent.lock().unwrap().clone();
        while let Some(node) = cursor {
            cursor = node.parent.lock().unwrap().clone();
            chain.push(node);
        }
        chain
    }

    /// Invoke every matching handler on this node. Handlers run outside the
    /// registration lock so they may subscribe, unsubscribe or re-trigger.
    fn deliver(&self, name: &str, mut data: Value) -> Result<Value, ()> {
        let matching: Vec<(u64, EventHandler, bool)> = {
            let handlers = self.handlers.lock().unwrap();
            handlers
                .iter()
                .filter(|reg| reg.name == name && selector_matches(reg.selector.as_ref(), &data))
                .map(|reg| (reg.id, reg.handler.clone(), reg.once))
                .collect()
        };

        let mut spent = Vec::new();
        let mut outcome = Ok(());
        for (id, handler, once) in matching {
            if once {
                spent.push(id);
            }
            match handler(&data) {
                EventOutcome::Continue => {}
                EventOutcome::Transform(next) => data = next,
                EventOutcome::Cancel => {
                    outcome = Err(());
                    break;
                }
            }
        }

        if !spent.is_empty() {
            let mut handlers = self.handlers.lock().unwrap();
            handlers.retain(|reg| !spent.contains(&reg.id));
        }

        outcome.map(|_| data)
    }
}

fn deliver_along(nodes: &[Arc<EventNode>], name: &str, mut data: Value) -> Result<Value, ()> {
    for node in nodes {
        data = node.deliver(name, data)?;
    }
    Ok(data)
}

fn cancelled(name: &str) -> BridgeError {
    BridgeError::Cancelled(name.to_string())
}

/// Structural match: every key declared by the selector must be present in
/// the data with an equal value
fn selector_matches(selector: Option<&Value>, data: &Value) -> bool {
    let Some(Value::Object(wanted)) = selector else {
        return true;
    };
    let Value::Object(actual) = data else {
        return wanted.is_empty();
    };
    wanted
        .iter()
        .all(|(key, value)| actual.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> impl Fn(&Value) -> EventOutcome {
        let log = log.clone();
        let tag = tag.to_string();
        move |_| {
            log.lock().unwrap().push(tag.clone());
            EventOutcome::Continue
        }
    }

    #[test]
    fn phase_ordering_across_parent_and_child() {
        let parent = EventNode::new("parent");
        let child = EventNode::new("child");
        child.set_parent(Some(&parent));

        let log = Arc::new(Mutex::new(Vec::new()));
        parent.on("before:x", None, recorder(&log, "parent-before"));
        child.on("before:x", None, recorder(&log, "child-before"));
        child.on("x", None, recorder(&log, "child-on"));
        parent.on("x", None, recorder(&log, "parent-on"));
        parent.on("after:x", None, recorder(&log, "parent-after"));
        child.on("after:x", None, recorder(&log, "child-after"));

        child.trigger("x", json!({})).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "parent-before",
                "child-before",
                "child-on",
                "parent-on",
                "parent-after",
                "child-after"
            ]
        );
    }

    #[test]
    fn cancel_aborts_remaining_stages() {
        let node = EventNode::new("node");
        let log = Arc::new(Mutex::new(Vec::new()));
        node.on("before:open", None, |_| EventOutcome::Cancel);
        node.on("open", None, recorder(&log, "on"));

        let result = node.trigger("open", json!({}));
        assert!(matches!(result, Err(BridgeError::Cancelled(_))));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn transform_flows_to_later_handlers() {
        let node = EventNode::new("node");
        node.on("open", None, |data| {
            let mut data = data.clone();
            data["decorated"] = json!(true);
            EventOutcome::Transform(data)
        });

        let result = node.trigger("open", json!({"url": "/a"})).unwrap();
        assert_eq!(result["decorated"], json!(true));
        assert_eq!(result["url"], json!("/a"));
    }

    #[test]
    fn selector_restricts_delivery() {
        let node = EventNode::new("node");
        let log = Arc::new(Mutex::new(Vec::new()));
        node.on(
            "user",
            Some(json!({"state": "signed-in"})),
            recorder(&log, "signed-in"),
        );

        node.trigger("user", json!({"state": "signed-out"})).unwrap();
        assert!(log.lock().unwrap().is_empty());

        node.trigger("user", json!({"state": "signed-in"})).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn one_fires_once() {
        let node = EventNode::new("node");
        let log = Arc::new(Mutex::new(Vec::new()));
        node.one("ready", None, recorder(&log, "once"));

        node.trigger("ready", json!({})).unwrap();
        node.trigger("ready", json!({})).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn off_removes_by_id() {
        let node = EventNode::new("node");
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = node.on("ready", None, recorder(&log, "a"));
        assert!(node.off(id));
        assert!(!node.off(id));

        node.trigger("ready", json!({})).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn reparenting_changes_propagation() {
        let root_a = EventNode::new("a");
        let root_b = EventNode::new("b");
        let child = EventNode::new("child");
        child.set_parent(Some(&root_a));

        let log = Arc::new(Mutex::new(Vec::new()));
        root_a.on("ping", None, recorder(&log, "a"));
        root_b.on("ping", None, recorder(&log, "b"));

        child.trigger("ping", json!({})).unwrap();
        child.set_parent(Some(&root_b));
        child.trigger("ping", json!({})).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }
}
