//! HTTP / WebSocket / SSE API layer.
//!
//! Handlers are thin - they resolve the target nest, check identity, and
//! delegate to the engines. The authentication *surface* (OAuth flows,
//! session cookies) lives upstream; the core only consumes an
//! authenticated-identity string, resolved here from a bearer-token table.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use thiserror::Error;

use crate::context::{CoreServices, NestHandle, MAIN_NEST};
use crate::error::{SongnestError, SongnestResult};

pub mod http;
pub mod sse;
pub mod ws;
pub mod ws_connection;

pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
#[derive(Clone)]
pub struct AppState {
    /// Process-wide core services.
    pub services: CoreServices,
    /// Tracks live WebSocket connections per nest.
    pub ws_manager: Arc<WsConnectionManager>,
}

impl AppState {
    pub fn new(services: CoreServices, ws_manager: Arc<WsConnectionManager>) -> Self {
        Self {
            services,
            ws_manager,
        }
    }

    /// Resolves a nest reference (id, code, or slug) to its engine stack.
    /// `None` means the main nest.
    pub async fn resolve_nest(&self, reference: Option<&str>) -> SongnestResult<NestHandle> {
        let reference = reference.unwrap_or(MAIN_NEST);
        let meta = self
            .services
            .registry
            .get_nest(reference)
            .await?
            .ok_or_else(|| SongnestError::NotFound(format!("nest {reference}")))?;
        Ok(self.services.nest(&meta.nest_id))
    }
}

/// The authenticated identity behind a request.
///
/// Resolved from `Authorization: Bearer <token>` against the configured
/// token table, or from a `token` query parameter for WebSocket clients
/// that cannot set headers. Rejections carry `WWW-Authenticate: Bearer`.
#[derive(Debug, Clone)]
pub struct Identity(pub String);

impl FromRequestParts<AppState> for Identity {
    type Rejection = SongnestError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let tokens = &state.services.config.api_tokens;
        if let Some(raw) = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            if let Some(token) = raw.strip_prefix("Bearer ") {
                if let Some(identity) = tokens.get(token.trim()) {
                    return Ok(Identity(identity.clone()));
                }
            }
        }
        if let Some(query) = parts.uri.query() {
            for pair in query.split('&') {
                if let Some(token) = pair.strip_prefix("token=") {
                    if let Some(identity) = tokens.get(token) {
                        return Ok(Identity(identity.clone()));
                    }
                }
            }
        }
        Err(SongnestError::Unauthorized)
    }
}

/// Starts the HTTP server on the given port.
pub async fn start_server(state: AppState, port: u16) -> Result<(), ServerError> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Server listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
