pub mod config;
pub mod error;
pub mod messages;
pub mod models;
pub mod utils;

pub use config::*;
pub use error::*;
pub use messages::*;
pub use models::*;
pub use utils::*;
