use std::sync::Arc;

use axum::{
  headers::ContentType, response::IntoResponse, routing::get, Router,
  TypedHeader,
};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod download;
mod error;
mod filename;
mod request;
mod util;
mod ytdlp;

use config::Config;
pub use error::{Error, Result};

pub const HOMEPAGE_HTML: &str = include_str!("../html/homepage.html");

#[tokio::main]
async fn main() -> Result<()> {
  init_logging();

  let config = Arc::new(Config::from_env()?);
  let addr = config.socket_addr();
  info!(
    "{} v{} listening on {}",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_VERSION"),
    addr
  );
  info!(
    "extraction tool: {}, timeout: {}ms",
    config.extractor.program.display(),
    config.timeout.as_millis()
  );

  axum::Server::try_bind(&addr)
    .map_err(|e| Error::Server(format!("failed to bind {addr}: {e}")))?
    .serve(app(config).into_make_service())
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| Error::Server(e.to_string()))?;

  info!("server stopped");
  Ok(())
}

pub fn app(config: Arc<Config>) -> Router {
  Router::new()
    .route("/", get(homepage))
    .route("/healthz", get(health))
    .route("/health", get(health))
    .route("/download", get(download::get_download))
    .layer(TraceLayer::new_for_http())
    .with_state(config)
}

fn init_logging() {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "yt_download_server=info,tower_http=info".into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::warn!("failed to listen for ctrl-c: {e}");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
      Ok(mut sig) => {
        sig.recv().await;
      }
      Err(e) => {
        tracing::warn!("failed to listen for SIGTERM: {e}");
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }

  info!("shutdown requested, draining in-flight downloads");
}

async fn homepage() -> impl IntoResponse {
  (
    TypedHeader::<ContentType>(ContentType::html()),
    HOMEPAGE_HTML,
  )
}

async fn health() -> impl IntoResponse {
  "ok".to_owned()
}
