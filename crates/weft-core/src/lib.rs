pub mod config;
pub mod error;
pub mod event;
pub mod expr;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{Result, WeftError};
pub use event::InMemoryEventBus;
pub use types::*;
