use std::{
  fmt,
  net::{IpAddr, Ipv6Addr},
};

use http_types::Url;
use serde::Deserialize;

use crate::{Error, Result};

/// Resolution heights a client may ask for. Anything else means "best".
pub const ALLOWED_HEIGHTS: [u32; 8] =
  [144, 240, 360, 480, 720, 1080, 1440, 2160];

/// Raw query string of `GET /download`.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadParams {
  pub url: Option<String>,
  pub quality: Option<String>,
  pub format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
  Height(u32),
  Best,
}

impl Quality {
  pub fn parse(value: Option<&str>) -> Self {
    let Some(value) = value else {
      return Quality::Best;
    };

    let value = value.trim();
    let digits = value
      .strip_suffix('p')
      .or_else(|| value.strip_suffix('P'))
      .unwrap_or(value);

    match digits.parse::<u32>() {
      Ok(height) if ALLOWED_HEIGHTS.contains(&height) => Quality::Height(height),
      _ => Quality::Best,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
  Mp4,
  Mp3,
}

impl MediaFormat {
  pub fn parse(value: Option<&str>) -> Result<Self> {
    match value.map(str::trim) {
      None | Some("") => Ok(MediaFormat::Mp4),
      Some(v) if v.eq_ignore_ascii_case("mp4") => Ok(MediaFormat::Mp4),
      Some(v) if v.eq_ignore_ascii_case("mp3") => Ok(MediaFormat::Mp3),
      Some(v) => Err(Error::UnsupportedFormat(v.to_string())),
    }
  }

  pub fn extension(self) -> &'static str {
    match self {
      MediaFormat::Mp4 => "mp4",
      MediaFormat::Mp3 => "mp3",
    }
  }

  pub fn mime_type(self) -> &'static str {
    match self {
      MediaFormat::Mp4 => "video/mp4",
      MediaFormat::Mp3 => "audio/mpeg",
    }
  }
}

impl fmt::Display for MediaFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.extension())
  }
}

/// A validated download request. Constructing one never touches the
/// filesystem or spawns anything.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
  pub url: Url,
  pub quality: Quality,
  pub format: MediaFormat,
}

impl DownloadRequest {
  pub fn from_params(params: DownloadParams) -> Result<Self> {
    let raw = params.url.as_deref().map(str::trim).unwrap_or_default();
    if raw.is_empty() {
      return Err(Error::MissingUrl);
    }

    let url = validate_url(raw)?;
    let format = MediaFormat::parse(params.format.as_deref())?;
    let quality = Quality::parse(params.quality.as_deref());

    Ok(Self {
      url,
      quality,
      format,
    })
  }
}

fn validate_url(raw: &str) -> Result<Url> {
  let url: Url = raw
    .parse()
    .map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;

  if !matches!(url.scheme(), "http" | "https") {
    return Err(Error::InvalidUrl(format!(
      "{raw}: unsupported scheme {}",
      url.scheme()
    )));
  }

  let host = url.host_str().unwrap_or_default();
  if host.is_empty() {
    return Err(Error::InvalidUrl(format!("{raw}: missing host")));
  }

  if is_local_host(host) {
    return Err(Error::ForbiddenHost(host.to_string()));
  }

  Ok(url)
}

fn is_local_host(host: &str) -> bool {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  let host = host.trim_end_matches('.');

  match host.parse::<IpAddr>() {
    Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_unspecified(),
    Ok(IpAddr::V6(ip)) => is_local_v6(&ip),
    Err(_) => host.eq_ignore_ascii_case("localhost"),
  }
}

fn is_local_v6(ip: &Ipv6Addr) -> bool {
  if ip.is_loopback() || ip.is_unspecified() {
    return true;
  }

  // ::ffff:127.0.0.1 and friends
  ip.to_ipv4_mapped()
    .map_or(false, |v4| v4.is_loopback() || v4.is_unspecified())
}
