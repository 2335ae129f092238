// panel-runtime/src/history.rs
use common::{BrowserState, PanelState};
use std::sync::{Arc, Mutex};

/// Where the navigation-state blob lives. The browser's history state in
/// production; an in-memory slot in tests and headless embedders.
pub trait HistoryBackend: Send + Sync {
    fn save(&self, state: &BrowserState);
    fn load(&self) -> Option<BrowserState>;
}

/// In-memory history backend
pub struct MemoryHistoryBackend {
    state: Mutex<Option<BrowserState>>,
}

impl MemoryHistoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
        })
    }
}

impl HistoryBackend for MemoryHistoryBackend {
    fn save(&self, state: &BrowserState) {
        *self.state.lock().unwrap() = Some(state.clone());
    }

    fn load(&self) -> Option<BrowserState> {
        self.state.lock().unwrap().clone()
    }
}

/// Panel snapshots for one environment scope, persisted through the backend
pub struct HistoryStore {
    backend: Arc<dyn HistoryBackend>,
    scope: String,
}

impl HistoryStore {
    pub fn new(backend: Arc<dyn HistoryBackend>, scope: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            scope: scope.into(),
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Record a snapshot, replacing any previous entry for the same panel
    pub fn record(&self, snapshot: PanelState) {
        tracing::debug!(
            "Recording history for panel '{}' (open: {})",
            snapshot.panel_id,
            snapshot.is_open
        );
        let mut state = self.backend.load().unwrap_or_default();
        state.record(&self.scope, snapshot);
        self.backend.save(&state);
    }

    /// Snapshots recorded for this scope, oldest transition first
    pub fn snapshots(&self) -> Vec<PanelState> {
        self.backend
            .load()
            .map(|state| state.for_scope(&self.scope))
            .unwrap_or_default()
    }
}
