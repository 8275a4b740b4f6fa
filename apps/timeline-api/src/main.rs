use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use timeline_kernel::{TimelineBuilder, TimelineKernel};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

mod auth;
mod config;
mod error;
mod openapi;
mod sse;
mod ws;

use crate::auth::{ContextResolver, JwtContextResolver};
use crate::config::Cli;
use crate::openapi::{openapi_spec, scalar_docs_html};

#[derive(Clone)]
pub(crate) struct AppState {
    kernel: TimelineKernel,
    resolver: Arc<dyn ContextResolver>,
    default_mode: Arc<str>,
    heartbeat: Duration,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(docs))
        .route("/docs/", get(docs))
        .route(
            "/sse/chat/{thread_id}",
            get(sse::stream_thread).post(sse::post_message),
        )
        .route("/ws/chat/{thread_id}", get(ws::ws_thread))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let kernel = TimelineBuilder::new(cli.route_table()?)
        .scope(&cli.tenant_id, &cli.env, &cli.project_id)
        .subscriber_capacity(cli.subscriber_capacity)
        .build()?;

    let state = AppState {
        kernel,
        resolver: Arc::new(JwtContextResolver::new(&cli.jwt_secret)),
        default_mode: Arc::from(cli.default_mode.as_str()),
        heartbeat: cli.heartbeat(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, env = %cli.env, "timeline-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "timeline-api"
    }))
}

async fn openapi_json() -> Json<serde_json::Value> {
    Json(openapi_spec())
}

async fn docs() -> Html<String> {
    Html(scalar_docs_html("/openapi.json"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
