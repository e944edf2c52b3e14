mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::storage::json_store::JsonFileStore;

pub use errors::{AppError, ErrorResponse};

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub store: Arc<JsonFileStore>,
    /// Path segment the states are served under.
    pub collection: String,
    /// Bearer token required on every store route when set.
    pub auth_key: Option<String>,
}

/// Options for [`serve`], resolved from CLI, env and config file.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub store_dir: PathBuf,
    pub collection: String,
    pub auth_key: Option<String>,
    pub max_body: usize,
}

/// Build the store service router.
pub fn router(state: Arc<AppState>, max_body: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/{collection}", get(handlers::list_states))
        .route(
            "/{collection}/{id}",
            get(handlers::get_state)
                .put(handlers::put_state)
                .delete(handlers::delete_state),
        )
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the workflow store over HTTP.
pub async fn serve(options: ServeOptions) -> Result<()> {
    let state = Arc::new(AppState {
        store: Arc::new(JsonFileStore::new(&options.store_dir)),
        collection: options.collection.clone(),
        auth_key: options.auth_key.clone(),
    });
    let app = router(state, options.max_body);

    let addr: SocketAddr = format!("{}:{}", options.host, options.port).parse()?;
    info!(
        collection = %options.collection,
        store_dir = %options.store_dir.display(),
        auth = options.auth_key.is_some(),
        "replayflow store server listening on {}", addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
