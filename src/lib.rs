pub mod accounting;
pub mod api;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod master;
pub mod resolver;
pub mod shutdown;
pub mod submit;

pub use bridge::Bridge;
pub use error::{GridError, Result};
