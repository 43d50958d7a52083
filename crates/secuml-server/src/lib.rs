//! secuml-server: Axum web server exposing SecuML experiments.
//!
//! The process context is built once by [`state::bootstrap`] before the
//! listener starts; handlers only read it.

pub mod api;
pub mod state;

use std::net::SocketAddr;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub use state::{bootstrap, AppContext, Application, Bootstrap, BootstrapError, ServerConfig};

/// Build the Axum router with all routes.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api::router())
        .with_state(ctx)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve `ctx` on the configured address until the process stops.
pub async fn serve(ctx: AppContext, config: ServerConfig) -> anyhow::Result<()> {
    let app = build_router(ctx);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("SecuML server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
