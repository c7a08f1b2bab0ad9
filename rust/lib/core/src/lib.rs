pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::ServiceError;
pub use types::{merge_patch, new_id, now_rfc3339};
