pub mod panel_state;
pub mod user;

pub use panel_state::*;
pub use user::*;
