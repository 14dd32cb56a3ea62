pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod kuber;
pub mod models;
pub mod routes;

use std::sync::Arc;

use crate::config::Config;
use crate::gateway::VncGateway;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Arc<VncGateway>,
}
