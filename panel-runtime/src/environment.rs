// panel-runtime/src/environment.rs
//
// Root coordinator for one remote environment: owns the transport broker,
// authentication, history and the root of the event tree, and provides the
// bearer-authenticated fetch every other component goes through. One
// environment per backend origin, handed out by the registry.

use crate::auth::{Authentication, SsoEndpoint, TokenFactory};
use crate::context::RuntimeContext;
use crate::events::EventNode;
use crate::frames::FrameFactory;
use crate::history::{HistoryBackend, HistoryStore};
use crate::transport::{InboundEnvelope, ListenerId, MessageBroker};
use async_trait::async_trait;
use common::{
    extract_error_message, names, normalize_keys, origin_of, same_origin, BridgeError, PanelState,
    RuntimeConfig,
};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

/// One HTTP request as the environment issues it
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub url: String,
    pub method: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
}

/// What came back: status plus the parsed JSON body (`Null` when the body
/// was empty or not JSON)
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Value,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The wire seam for `fetch`. Production goes through reqwest; tests script
/// replies.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, call: HttpCall) -> Result<HttpReply, BridgeError>;
}

/// reqwest-backed HTTP backend
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, call: HttpCall) -> Result<HttpReply, BridgeError> {
        let method = reqwest::Method::from_bytes(call.method.as_bytes())
            .map_err(|_| BridgeError::Config(format!("invalid http method '{}'", call.method)))?;

        let mut request = self.client.request(method, &call.url);
        if let Some(bearer) = &call.bearer {
            request = request.bearer_auth(bearer);
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| BridgeError::Http {
            status: 0,
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(HttpReply { status, body })
    }
}

/// Options merged in by `configure`
#[derive(Clone, Default)]
pub struct EnvironmentOptions {
    pub token_factory: Option<TokenFactory>,
}

pub struct Environment {
    ctx: Arc<RuntimeContext>,
    http: Arc<dyn HttpBackend>,
    /// Client bootstrap payload from `/init`; the async lock de-duplicates
    /// concurrent configure calls
    bootstrap: tokio::sync::Mutex<Option<Value>>,
    nav_listener: std::sync::Mutex<Option<ListenerId>>,
}

impl Environment {
    pub fn new(
        config: Arc<RuntimeConfig>,
        endpoint: Arc<dyn SsoEndpoint>,
        frames: Arc<dyn FrameFactory>,
        history_backend: Arc<dyn HistoryBackend>,
        http: Arc<dyn HttpBackend>,
    ) -> Arc<Self> {
        let events = EventNode::new("environment");
        let auth = Authentication::new(endpoint, EventNode::new("auth"));
        auth.events().set_parent(Some(&events));

        let scope = origin_of(&config.environment_url)
            .unwrap_or_else(|_| config.environment_url.clone());
        let broker = MessageBroker::new(config.timeouts.receipt());
        let history = HistoryStore::new(history_backend, scope);
        let group_id = Uuid::new_v4().to_string();

        let ctx = RuntimeContext::new(config, broker, auth, frames, history, events, group_id);
        tracing::info!("Environment created for {}", ctx.allowed_origin);

        // frames request app navigation upward; surface it as an event
        let events = ctx.events.clone();
        let nav_listener = ctx.broker.add_listener(
            names::NAVIGATION_OPEN,
            Arc::new(move |envelope: &InboundEnvelope| {
                let _ = events.trigger(
                    "navigation-open",
                    Value::Object(envelope.message.payload.clone()),
                );
            }),
        );

        Arc::new(Self {
            ctx,
            http,
            bootstrap: tokio::sync::Mutex::new(None),
            nav_listener: std::sync::Mutex::new(Some(nav_listener)),
        })
    }

    /// The shared plumbing panels and managers are built on
    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    pub fn events(&self) -> &Arc<EventNode> {
        &self.ctx.events
    }

    pub fn auth(&self) -> &Arc<Authentication> {
        &self.ctx.auth
    }

    pub fn url(&self) -> &str {
        &self.ctx.config.environment_url
    }

    /// JSON fetch against the environment, bearer-authenticated. Rejects
    /// cross-origin targets outright. An auth-rejection status triggers
    /// exactly one retry with a force-refreshed token; the retry's outcome
    /// is final. Response keys come back camelCased.
    pub async fn fetch(
        &self,
        url: &str,
        data: Option<Value>,
        method: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let resolved = self.resolve_same_origin(url)?;
        let method = method.unwrap_or("GET").to_string();

        let bearer = if self.ctx.auth.has_token_factory() {
            Some(self.ctx.auth.get_access_token(false).await?)
        } else {
            None
        };

        let reply = self
            .http
            .execute(HttpCall {
                url: resolved.clone(),
                method: method.clone(),
                bearer,
                body: data.clone(),
            })
            .await?;

        let reply = if self.is_auth_rejection(reply.status) && self.ctx.auth.has_token_factory() {
            tracing::debug!(
                "Fetch of {} rejected with {}, retrying once with a fresh token",
                resolved,
                reply.status
            );
            let bearer = Some(self.ctx.auth.get_access_token(true).await?);
            self.http
                .execute(HttpCall {
                    url: resolved,
                    method,
                    bearer,
                    body: data,
                })
                .await?
        } else {
            reply
        };

        if reply.is_success() {
            Ok(normalize_keys(reply.body))
        } else {
            let message = extract_error_message(&reply.body)
                .unwrap_or_else(|| format!("HTTP {}", reply.status));
            Err(BridgeError::Http {
                status: reply.status,
                message,
            })
        }
    }

    /// Merge options and run the one-time client bootstrap. Concurrent
    /// configures share a single `/init` fetch; later calls return the
    /// cached payload.
    pub async fn configure(&self, options: EnvironmentOptions) -> Result<Value, BridgeError> {
        if let Some(factory) = options.token_factory {
            self.ctx.auth.set_token_factory(factory);
        }

        let mut bootstrap = self.bootstrap.lock().await;
        if let Some(payload) = bootstrap.as_ref() {
            return Ok(payload.clone());
        }

        let payload = self.fetch("/init", None, None).await?;
        tracing::info!(
            "Environment configured (version {})",
            payload["version"].as_str().unwrap_or("unknown")
        );
        *bootstrap = Some(payload.clone());
        drop(bootstrap);

        let _ = self
            .ctx
            .events
            .trigger("configured", payload.clone());
        Ok(payload)
    }

    /// Re-read the persisted per-origin state and re-emit it for panels and
    /// apps to reapply, typically on back/forward navigation
    pub fn restore_history(&self) -> Vec<PanelState> {
        let snapshots = self.ctx.history.snapshots();
        tracing::debug!(
            "Restoring {} panel snapshot(s) for {}",
            snapshots.len(),
            self.ctx.history.scope()
        );
        let _ = self.ctx.events.trigger(
            "history-restore",
            json!({
                "scope": self.ctx.history.scope(),
                "panels": snapshots,
            }),
        );
        snapshots
    }

    fn is_auth_rejection(&self, status: u16) -> bool {
        self.ctx.config.retry_statuses.contains(&status)
    }

    fn resolve_same_origin(&self, url: &str) -> Result<String, BridgeError> {
        let base = Url::parse(&self.ctx.config.environment_url)
            .map_err(|e| BridgeError::Config(format!("invalid environment url: {}", e)))?;
        let resolved = base
            .join(url)
            .map_err(|e| BridgeError::Config(format!("invalid url '{}': {}", url, e)))?
            .to_string();

        if !same_origin(&resolved, &self.ctx.config.environment_url) {
            return Err(BridgeError::InvalidOrigin {
                window: "fetch".to_string(),
                expected: self.ctx.allowed_origin.clone(),
                observed: origin_of(&resolved).unwrap_or(resolved),
            });
        }
        Ok(resolved)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.nav_listener.lock() {
            if let Some(id) = listener.take() {
                self.ctx.broker.remove_listener(names::NAVIGATION_OPEN, id);
            }
        }
    }
}

/// One environment per backend origin, created on demand. Explicit registry
/// instead of hidden module state: embedders construct one and pass it
/// where it is needed.
pub struct EnvironmentRegistry {
    environments: DashMap<String, Arc<Environment>>,
    builder: Box<dyn Fn(&str) -> Arc<Environment> + Send + Sync>,
}

impl EnvironmentRegistry {
    /// The builder receives the environment URL and assembles the instance
    /// with the embedder's backends
    pub fn new(builder: impl Fn(&str) -> Arc<Environment> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            environments: DashMap::new(),
            builder: Box::new(builder),
        })
    }

    /// The environment for a URL's origin, created on first request
    pub fn get_or_create(&self, url: &str) -> Result<Arc<Environment>, BridgeError> {
        let origin = origin_of(url)?;
        let entry = self
            .environments
            .entry(origin)
            .or_insert_with(|| (self.builder)(url));
        Ok(entry.clone())
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_http {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted backend recording every call it sees
    pub struct ScriptedHttp {
        replies: Mutex<VecDeque<HttpReply>>,
        pub calls: Mutex<Vec<HttpCall>>,
    }

    impl ScriptedHttp {
        pub fn new(replies: Vec<HttpReply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpBackend for ScriptedHttp {
        async fn execute(&self, call: HttpCall) -> Result<HttpReply, BridgeError> {
            self.calls.lock().unwrap().push(call);
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(HttpReply {
                    status: 200,
                    body: Value::Null,
                }))
        }
    }

    pub fn ok(body: Value) -> HttpReply {
        HttpReply { status: 200, body }
    }

    pub fn status(status: u16, body: Value) -> HttpReply {
        HttpReply { status, body }
    }
}
