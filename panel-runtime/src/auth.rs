// panel-runtime/src/auth.rs
//
// Authentication/token manager. Owns the caller-supplied token factory,
// de-duplicates in-flight token requests, and validates the signed-in
// session against the remote environment. State transitions are emitted as
// `user` events; failures additionally surface as `authentication-error`
// events so UI layers can react without every caller catching them.

use crate::deferred::Deferred;
use crate::events::EventNode;
use async_trait::async_trait;
use common::{AuthSnapshot, BridgeError, User, UserEventState};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Caller-supplied async token producer. The boolean asks for a forced
/// refresh.
pub type TokenFactory =
    Arc<dyn Fn(bool) -> BoxFuture<'static, Result<String, BridgeError>> + Send + Sync>;

/// The remote environment's single-sign-on surface
#[async_trait]
pub trait SsoEndpoint: Send + Sync {
    /// Resolve the user behind a bearer token, or behind ambient session
    /// state when no token factory is configured
    async fn resolve_user(&self, bearer: Option<&str>) -> Result<User, BridgeError>;

    /// Best-effort server-side sign-out notification
    async fn notify_sign_out(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

type SharedToken = Shared<BoxFuture<'static, Result<String, String>>>;

struct TokenState {
    factory: Option<TokenFactory>,
    cached: Option<String>,
    in_flight: Option<SharedToken>,
    /// Bumped whenever the factory or cache is invalidated, so a stale
    /// request cannot repopulate the cache
    generation: u64,
}

pub struct Authentication {
    endpoint: Arc<dyn SsoEndpoint>,
    events: Arc<EventNode>,
    tokens: Mutex<TokenState>,
    /// `None` means no session established yet; the signed-out sentinel is a
    /// real, validated state
    user: Mutex<Option<User>>,
    authenticated_gate: Deferred<User>,
    authorized_gate: Deferred<User>,
}

impl Authentication {
    pub fn new(endpoint: Arc<dyn SsoEndpoint>, events: Arc<EventNode>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            events,
            tokens: Mutex::new(TokenState {
                factory: None,
                cached: None,
                in_flight: None,
                generation: 0,
            }),
            user: Mutex::new(None),
            authenticated_gate: Deferred::new(),
            authorized_gate: Deferred::new(),
        })
    }

    pub fn events(&self) -> &Arc<EventNode> {
        &self.events
    }

    /// Replace the token-producing function and drop the token cache
    pub fn set_token_factory(&self, factory: TokenFactory) {
        let mut state = self.tokens.lock().unwrap();
        state.factory = Some(factory);
        state.cached = None;
        state.in_flight = None;
        state.generation += 1;
    }

    pub fn has_token_factory(&self) -> bool {
        self.tokens.lock().unwrap().factory.is_some()
    }

    /// Current access token. Returns the cached token unless `refresh` is
    /// set; concurrent callers share a single in-flight factory invocation.
    pub async fn get_access_token(&self, refresh: bool) -> Result<String, BridgeError> {
        let (request, generation) = {
            let mut state = self.tokens.lock().unwrap();
            if !refresh {
                if let Some(token) = state.cached.clone() {
                    return Ok(token);
                }
                if let Some(in_flight) = state.in_flight.clone() {
                    (in_flight, state.generation)
                } else {
                    self.start_token_request(&mut state, refresh)?
                }
            } else {
                state.cached = None;
                self.start_token_request(&mut state, refresh)?
            }
        };

        let result = request.await;

        let mut state = self.tokens.lock().unwrap();
        if state.generation == generation {
            state.in_flight = None;
            if let Ok(token) = &result {
                state.cached = Some(token.clone());
            }
        }
        result.map_err(BridgeError::TokenFactory)
    }

    fn start_token_request(
        &self,
        state: &mut TokenState,
        refresh: bool,
    ) -> Result<(SharedToken, u64), BridgeError> {
        let factory = state
            .factory
            .clone()
            .ok_or_else(|| BridgeError::TokenFactory("no token factory configured".into()))?;

        state.generation += 1;
        let generation = state.generation;

        let request: SharedToken = async move {
            match factory(refresh).await {
                Ok(token) if !token.is_empty() => Ok(token),
                Ok(_) => Err("token factory returned an empty token".to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(request.clone());
        Ok((request, generation))
    }

    /// Idempotent initialization: validates the token factory against the
    /// single-sign-on endpoint, or ambient session state without one
    pub async fn init(&self, factory: Option<TokenFactory>) -> Result<User, BridgeError> {
        if let Some(factory) = factory {
            self.set_token_factory(factory);
        }
        if let Some(user) = self.user.lock().unwrap().clone() {
            return Ok(user);
        }
        self.check_user_state().await
    }

    /// Poll the remote environment for the current user. A `401` is retried
    /// exactly once with a force-refreshed token. Persistent failure
    /// resolves to the no-session sentinel and leaves a `user-error` state
    /// observable, rather than rejecting.
    pub async fn check_user_state(&self) -> Result<User, BridgeError> {
        let resolved = if self.has_token_factory() {
            self.resolve_with_token().await
        } else {
            self.endpoint.resolve_user(None).await
        };

        match resolved {
            Ok(user) => {
                self.apply_user(user.clone());
                Ok(user)
            }
            Err(e) => {
                tracing::warn!("User state check failed: {}", e);
                self.emit_user_error(&e);
                Ok(User::signed_out())
            }
        }
    }

    async fn resolve_with_token(&self) -> Result<User, BridgeError> {
        let token = self.get_access_token(false).await?;
        match self.endpoint.resolve_user(Some(&token)).await {
            Ok(user) => Ok(user),
            Err(BridgeError::Http { status: 401, .. }) => {
                tracing::debug!("Access token rejected, retrying once with forced refresh");
                let token = self.get_access_token(true).await?;
                self.endpoint.resolve_user(Some(&token)).await
            }
            Err(e) => Err(e),
        }
    }

    /// Explicit sign-in: mint a fresh token and revalidate the session
    pub async fn sign_in(&self) -> Result<User, BridgeError> {
        self.get_access_token(true).await?;
        let user = self.check_user_state().await?;
        if user.is_signed_out() {
            Err(BridgeError::Unauthorized(
                "sign-in did not produce an authorized user".into(),
            ))
        } else {
            Ok(user)
        }
    }

    /// Sign out: best-effort server notification, guaranteed local state
    /// clear. Never fails.
    pub async fn sign_out(&self, clear_factory: bool) {
        if let Err(e) = self.endpoint.notify_sign_out().await {
            tracing::warn!("Server sign-out notification failed: {}", e);
        }

        {
            let mut state = self.tokens.lock().unwrap();
            state.cached = None;
            state.in_flight = None;
            state.generation += 1;
            if clear_factory {
                state.factory = None;
            }
        }

        self.apply_user(User::signed_out());
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        match self.user.lock().unwrap().clone() {
            Some(user) => AuthSnapshot::for_user(user),
            None => AuthSnapshot::unauthenticated(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.snapshot().is_authenticated
    }

    pub fn is_authorized(&self) -> bool {
        self.snapshot().is_authorized
    }

    pub fn user(&self) -> Option<User> {
        self.user.lock().unwrap().clone()
    }

    /// Readiness gate that resolves once a session is established
    pub fn when_authenticated(&self) -> &Deferred<User> {
        &self.authenticated_gate
    }

    /// Readiness gate that resolves once the session is authorized; reset
    /// again on sign-out
    pub fn when_authorized(&self) -> &Deferred<User> {
        &self.authorized_gate
    }

    fn apply_user(&self, user: User) {
        let previous = self.user.lock().unwrap().replace(user.clone());
        let snapshot = AuthSnapshot::for_user(user.clone());

        self.authenticated_gate.resolve(user.clone());
        if snapshot.is_authorized {
            self.authorized_gate.resolve(user.clone());
        } else {
            self.authorized_gate.reset();
        }

        let state = match &previous {
            None => {
                if user.is_signed_out() {
                    UserEventState::SignedOut
                } else {
                    UserEventState::SignedIn
                }
            }
            Some(prev) if prev.is_signed_out() && !user.is_signed_out() => UserEventState::SignedIn,
            Some(prev) if !prev.is_signed_out() && user.is_signed_out() => UserEventState::SignedOut,
            Some(prev) if prev.id != user.id => UserEventState::ChangedUser,
            Some(_) => UserEventState::Updated,
        };

        tracing::info!("User state transition: {:?} (user {})", state, user.id);
        let _ = self.events.trigger(
            "user",
            json!({
                "state": state,
                "authorized": snapshot.is_authorized,
                "user": user,
            }),
        );
    }

    fn emit_user_error(&self, error: &BridgeError) {
        let snapshot = self.snapshot();
        let _ = self.events.trigger(
            "user",
            json!({
                "state": UserEventState::UserError,
                "authorized": snapshot.is_authorized,
                "user": snapshot.user,
            }),
        );
        let _ = self
            .events
            .trigger("authentication-error", json!({ "message": error.to_string() }));
    }
}
