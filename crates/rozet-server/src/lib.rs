pub mod agents;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hub;
pub mod routes;
pub mod server;
pub mod sessions;
pub mod tracker;
pub mod ws;

pub use config::{AuthConfig, RetentionConfig, ServerConfig};
pub use engine::{EngineReport, ExecutionEngine, NoopEngine};
pub use server::{start, AppState, ServerHandle};
