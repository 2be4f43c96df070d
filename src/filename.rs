//! Download names that survive every common filesystem and HTTP client.

use crate::request::MediaFormat;

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

pub fn fallback(format: MediaFormat) -> String {
  format!("download.{format}")
}

/// Strip control characters and characters forbidden on Windows, macOS or
/// Linux filesystems.
pub fn sanitize(name: &str, format: MediaFormat) -> String {
  let cleaned: String = name
    .chars()
    .filter(|c| !c.is_control() && !FORBIDDEN.contains(c))
    .collect();
  let cleaned = cleaned.trim().trim_end_matches('.').trim_end();

  if cleaned.is_empty() {
    fallback(format)
  } else {
    cleaned.to_string()
  }
}

/// ASCII-only rendition for clients that ignore `filename*`.
pub fn ascii_fallback(name: &str, format: MediaFormat) -> String {
  let mut ascii = String::with_capacity(name.len());
  for c in name.chars() {
    match c {
      ' '..='~' if c != '"' && c != '\\' => ascii.push(c),
      _ if ascii.ends_with('_') => {}
      _ => ascii.push('_'),
    }
  }

  let ascii = ascii.trim_matches(|c: char| c == '_' || c.is_whitespace());
  let base = ascii.rsplit_once('.').map_or(ascii, |(base, _)| base);
  if base.trim_matches(|c: char| c == '_' || c == '.').trim().is_empty() {
    fallback(format)
  } else {
    ascii.to_string()
  }
}

/// `Content-Disposition` value carrying both a plain ASCII name and the
/// RFC 5987 UTF-8 name.
pub fn content_disposition(name: &str, format: MediaFormat) -> String {
  let name = sanitize(name, format);
  format!(
    "attachment; filename=\"{}\"; filename*=UTF-8''{}",
    ascii_fallback(&name, format),
    urlencoding::encode(&name)
  )
}
