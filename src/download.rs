use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use axum::{
  body::{self, StreamBody},
  extract::{Query, State},
  response::Response,
};
use http::{header, StatusCode};
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::{
  config::Config,
  filename,
  request::{DownloadParams, DownloadRequest, MediaFormat},
  util::{ByteStream, WorkDir},
  ytdlp, Error, Result,
};

/// `GET /download?url=..&quality=..&format=..`
///
/// Every exit path drops the request's [`WorkDir`]; on success it is handed
/// to the response body and dropped with it.
#[axum::debug_handler]
pub async fn get_download(
  State(config): State<Arc<Config>>,
  Query(params): Query<DownloadParams>,
) -> Result<Response> {
  let request = DownloadRequest::from_params(params)?;
  info!(
    url = %request.url,
    quality = ?request.quality,
    format = %request.format,
    "download requested"
  );

  let work_dir = WorkDir::create(&config.work_root)?;
  let args = ytdlp::build_args(&request, work_dir.path(), &config);
  ytdlp::run(&config.extractor, args, config.timeout).await?;

  let artifact = find_artifact(work_dir.path(), request.format)
    .await?
    .ok_or(Error::NoOutput(request.format))?;

  serve_artifact(&artifact, request.format, work_dir).await
}

/// Locate the produced file by extension. If the tool left more than one,
/// the lexicographically smallest name wins.
pub async fn find_artifact(
  dir: &Path,
  format: MediaFormat,
) -> Result<Option<PathBuf>> {
  let mut entries = tokio::fs::read_dir(dir).await.map_err(Error::ReadDir)?;
  let mut found: Vec<PathBuf> = vec![];

  while let Some(entry) = entries.next_entry().await.map_err(Error::ReadDir)? {
    let path = entry.path();
    let matches_ext = path
      .extension()
      .map_or(false, |ext| ext.eq_ignore_ascii_case(format.extension()));
    if !matches_ext {
      continue;
    }

    let file_type = entry.file_type().await.map_err(Error::ReadDir)?;
    if file_type.is_file() {
      found.push(path);
    }
  }

  found.sort();
  Ok(found.into_iter().next())
}

async fn serve_artifact(
  path: &Path,
  format: MediaFormat,
  work_dir: WorkDir,
) -> Result<Response> {
  let file = tokio::fs::File::open(path).await?;
  let len = file.metadata().await?.len();
  let name = path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_else(|| filename::fallback(format));

  info!("serving {} ({} bytes)", name, len);

  let disposition = filename::content_disposition(&name, format);
  let stream = ByteStream::new(ReaderStream::new(file), work_dir)
    .name(name)
    .total_bytes(len);

  let resp = http::Response::builder()
    .status(StatusCode::OK)
    .header(header::CONTENT_TYPE, format.mime_type())
    .header(header::CONTENT_LENGTH, len)
    .header(header::CONTENT_DISPOSITION, disposition)
    .body(body::boxed(StreamBody::new(stream)))?;

  Ok(resp)
}
