// common/src/models/user.rs
use serde::{Deserialize, Serialize};

/// Sentinel user id meaning "authenticated but explicitly signed out".
/// Distinct from having no session at all.
pub const SIGNED_OUT_ID: i64 = -1;

/// A user as resolved by the remote environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl User {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            uid: None,
            display_name: None,
        }
    }

    /// The "no session" user: authenticated against nothing
    pub fn signed_out() -> Self {
        Self::new(SIGNED_OUT_ID)
    }

    pub fn is_signed_out(&self) -> bool {
        self.id == SIGNED_OUT_ID
    }
}

/// Transitions reported through `user` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserEventState {
    SignedIn,
    SignedOut,
    ChangedUser,
    Updated,
    UserError,
}

/// Snapshot of the authentication state machine.
/// Invariant: `is_authorized` implies `is_authenticated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSnapshot {
    pub user: Option<User>,
    pub is_authenticated: bool,
    pub is_authorized: bool,
}

impl AuthSnapshot {
    pub fn unauthenticated() -> Self {
        Self {
            user: None,
            is_authenticated: false,
            is_authorized: false,
        }
    }

    pub fn for_user(user: User) -> Self {
        let authorized = !user.is_signed_out();
        Self {
            user: Some(user),
            is_authenticated: true,
            is_authorized: authorized,
        }
    }
}
