//! Mutating admission webhook for Pods
//!
//! The API server posts every Pod create to `/mutate`. The handler parses the
//! network-selection annotations, aggregates what the selected networks need
//! and answers with a JSON patch:
//!
//! - [`selection`] parses the annotation value into network selections
//! - [`aggregate`] folds selections into resource counts and node labels
//! - [`patch`] turns the aggregate into ordered JSON patch operations
//! - [`handler`] owns the HTTP boundary and the admission decision
//!
//! A plain health endpoint is served separately by [`health_router`].

pub mod aggregate;
pub mod handler;
pub mod owner;
pub mod patch;
pub mod quantity;
pub mod selection;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::config::ConfigStore;
use crate::nad::NetworkDefinitions;
use owner::OwnerNamespaceResolver;

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Control switches and patch tables
    pub config: Arc<ConfigStore>,
    /// NetworkAttachmentDefinition lookups
    pub definitions: Arc<dyn NetworkDefinitions>,
    /// Namespace fallback for Pods without one
    pub owners: Arc<dyn OwnerNamespaceResolver>,
}

impl WebhookState {
    /// Create webhook state from its collaborators
    pub fn new(
        config: Arc<ConfigStore>,
        definitions: Arc<dyn NetworkDefinitions>,
        owners: Arc<dyn OwnerNamespaceResolver>,
    ) -> Self {
        Self {
            config,
            definitions,
            owners,
        }
    }
}

/// Create the webhook router
///
/// - POST /mutate - Mutate Pods according to their network selections
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(handler::mutate_handler))
        .with_state(state)
}

/// Create the health check router
///
/// - GET /healthz - Always 200 while the process serves HTTP
pub fn health_router() -> Router {
    Router::new().route("/healthz", get(|| async { "ok" }))
}
