use std::{path::PathBuf, time::Duration};

use axum::response::{IntoResponse, Response};
use http::StatusCode;

use crate::request::MediaFormat;

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("missing url parameter")]
  MissingUrl,

  #[error("invalid url: {0}")]
  InvalidUrl(String),

  #[error("url host is not allowed: {0}")]
  ForbiddenHost(String),

  #[error("unsupported format: {0}")]
  UnsupportedFormat(String),

  #[error("server misconfigured: extraction tool not found at {0}")]
  ExtractorMissing(PathBuf),

  #[error("failed to start extraction tool: {0}")]
  Spawn(#[source] std::io::Error),

  #[error("download failed (exit code {code}):\n{diagnostics}")]
  ExtractorFailed { code: String, diagnostics: String },

  #[error("download timed out after {}ms", .0.as_millis())]
  Timeout(Duration),

  #[error("no {0} output produced")]
  NoOutput(MediaFormat),

  #[error("failed to read download directory: {0}")]
  ReadDir(#[source] std::io::Error),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("server error: {0}")]
  Server(String),

  #[error("failed to build response: {0}")]
  Response(#[from] http::Error),

  #[error("IO error: {0}")]
  IO(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  pub fn status(&self) -> StatusCode {
    match self {
      Error::MissingUrl
      | Error::InvalidUrl(_)
      | Error::ForbiddenHost(_)
      | Error::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      tracing::error!("request failed: {self}");
    } else {
      tracing::warn!("request rejected: {self}");
    }

    (status, self.to_string()).into_response()
  }
}
