//! Panel and frame messaging engine.
//!
//! A client runtime for embedding remote content surfaces ("panels") in
//! sandboxed frames: an origin-validated message broker with receipt
//! correlation, a phased event bus, panel and overlay lifecycle state
//! machines, token-based authentication against the remote environment,
//! and history snapshotting for back/forward restoration.

pub mod auth;
pub mod context;
pub mod deferred;
pub mod environment;
pub mod events;
pub mod framecheck;
pub mod frames;
pub mod history;
pub mod overlay;
pub mod panel;
pub mod transport;

pub use auth::{Authentication, SsoEndpoint, TokenFactory};
pub use context::RuntimeContext;
pub use deferred::Deferred;
pub use environment::{
    Environment, EnvironmentOptions, EnvironmentRegistry, HttpBackend, HttpCall, HttpReply,
    ReqwestBackend,
};
pub use events::{EventHandler, EventNode, EventOutcome, HandlerId};
pub use framecheck::FrameCheck;
pub use frames::{ChannelFrame, ChannelFrameFactory, FrameCommand, FrameFactory, FrameWindow};
pub use history::{HistoryBackend, HistoryStore, MemoryHistoryBackend};
pub use overlay::{OverlayManager, OverlayRequest};
pub use panel::{Panel, PanelOptions};
pub use transport::{InboundEnvelope, ListenerId, MessageBroker, MessageListener, WindowChannel};
