// common/src/error.rs
use thiserror::Error;

/// Error taxonomy shared by the transport, panel, auth and environment layers.
///
/// Transport and panel errors surface as rejected futures to the immediate
/// caller; they never tear down the runtime. Authentication failures are
/// additionally re-emitted as `authentication-error` events so UI layers can
/// react without every caller catching them.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No receipt (or ready signal) arrived within the configured window.
    /// Recoverable: callers typically retry or reset the panel.
    #[error("timed out after {0} ms waiting for an acknowledgement")]
    Timeout(u64),

    /// The target window's observed origin does not match its registered
    /// origin. Security violation, never retried.
    #[error("origin mismatch for '{window}': expected {expected}, observed {observed}")]
    InvalidOrigin {
        window: String,
        expected: String,
        observed: String,
    },

    /// A message was sent to a logical name with no live registration.
    #[error("no content window registered as '{0}'")]
    NotRegistered(String),

    /// The panel's frame is not attached to a rendering surface.
    #[error("frame for panel '{0}' is not attached")]
    NotConnected(String),

    /// The caller-supplied token factory is absent, failed, or produced an
    /// unusable token.
    #[error("token factory failed: {0}")]
    TokenFactory(String),

    /// The current session is not authorized for the requested operation.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Non-2xx response from the environment, carrying the best human
    /// message the body offered.
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    /// An event handler vetoed the operation mid-flight.
    #[error("'{0}' was cancelled by an event handler")]
    Cancelled(String),

    /// Invalid runtime configuration or URL.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the error is worth retrying at a higher level.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BridgeError::Timeout(_))
    }
}
