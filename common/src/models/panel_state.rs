// common/src/models/panel_state.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Serialized snapshot of a single panel, used for browser back/forward
/// restoration and deep-linking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelState {
    pub panel_id: String,
    pub is_open: bool,
    pub location: Option<String>,
    pub status_code: Option<u16>,
    pub title: Option<String>,
    /// Timestamp of the last state transition, used for restore ordering
    pub changed_at: DateTime<Utc>,
}

impl PanelState {
    /// Whether the snapshot points at an error page and must not be restored
    pub fn is_error_page(&self) -> bool {
        matches!(self.status_code, Some(code) if code >= 400)
    }
}

/// The navigation-state blob: per environment scope, the latest snapshot of
/// every panel that recorded history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserState {
    pub scopes: HashMap<String, Vec<PanelState>>,
}

impl BrowserState {
    /// Record a snapshot, replacing any previous entry for the same panel
    pub fn record(&mut self, scope: &str, state: PanelState) {
        let entries = self.scopes.entry(scope.to_string()).or_default();
        entries.retain(|s| s.panel_id != state.panel_id);
        entries.push(state);
    }

    /// Snapshots for a scope, oldest transition first
    pub fn for_scope(&self, scope: &str) -> Vec<PanelState> {
        let mut entries = self.scopes.get(scope).cloned().unwrap_or_default();
        entries.sort_by_key(|s| s.changed_at);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(panel_id: &str, open: bool) -> PanelState {
        PanelState {
            panel_id: panel_id.to_string(),
            is_open: open,
            location: None,
            status_code: Some(200),
            title: None,
            changed_at: Utc::now(),
        }
    }

    #[test]
    fn record_replaces_same_panel() {
        let mut state = BrowserState::default();
        state.record("env", snapshot("messenger", false));
        state.record("env", snapshot("messenger", true));

        let entries = state.for_scope("env");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_open);
    }

    #[test]
    fn error_pages_are_flagged() {
        let mut snap = snapshot("files", true);
        snap.status_code = Some(404);
        assert!(snap.is_error_page());
    }
}
