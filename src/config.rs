use std::{
  env,
  ffi::OsString,
  net::{IpAddr, SocketAddr},
  path::{Path, PathBuf},
  time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
  AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
pub const DEFAULT_REFERER: &str = "https://www.youtube.com/";

const COOKIE_FILE_NAME: &str = "yt-download-cookies.txt";

/// How the extraction tool is launched. `leading_args` go before the
/// arguments generated for each request.
#[derive(Debug, Clone)]
pub struct ExtractorCommand {
  pub program: PathBuf,
  pub leading_args: Vec<OsString>,
}

impl ExtractorCommand {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      leading_args: vec![],
    }
  }
}

impl Default for ExtractorCommand {
  fn default() -> Self {
    Self::new("yt-dlp")
  }
}

/// Process-wide settings, loaded once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
  pub host: IpAddr,
  pub port: u16,
  pub timeout: Duration,
  pub user_agent: String,
  pub referer: String,
  pub cookie_file: Option<PathBuf>,
  pub proxy: Option<String>,
  pub extractor: ExtractorCommand,
  /// Parent of the per-request working directories.
  pub work_root: PathBuf,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      host: IpAddr::from([0, 0, 0, 0]),
      port: DEFAULT_PORT,
      timeout: DEFAULT_TIMEOUT,
      user_agent: DEFAULT_USER_AGENT.to_string(),
      referer: DEFAULT_REFERER.to_string(),
      cookie_file: None,
      proxy: None,
      extractor: ExtractorCommand::default(),
      work_root: env::temp_dir(),
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut config = Config::default();

    if let Some(host) = var("HOST") {
      config.host = host
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("HOST={host}: {e}")))?;
    }

    if let Some(port) = var("PORT") {
      config.port = port
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("PORT={port}: {e}")))?;
    }

    if let Some(ms) = var("DOWNLOAD_TIMEOUT_MS") {
      let ms: u64 = ms
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("DOWNLOAD_TIMEOUT_MS={ms}: {e}")))?;
      if ms == 0 {
        return Err(Error::Config("DOWNLOAD_TIMEOUT_MS must be > 0".into()));
      }
      config.timeout = Duration::from_millis(ms);
    }

    if let Some(ua) = var("YTDLP_USER_AGENT") {
      config.user_agent = ua;
    }

    if let Some(referer) = var("YTDLP_REFERER") {
      config.referer = referer;
    }

    if let Some(path) = var("YTDLP_PATH") {
      config.extractor = ExtractorCommand::new(path);
    }

    if let Some(dir) = var("WORK_DIR") {
      config.work_root = PathBuf::from(dir);
    }

    config.proxy = var("YTDLP_PROXY");
    if let Some(proxy) = &config.proxy {
      info!("using proxy: {}", redact_proxy(proxy));
    }

    config.cookie_file = match var("COOKIES_BASE64") {
      Some(blob) => {
        let path = env::temp_dir().join(COOKIE_FILE_NAME);
        write_cookie_file(&blob, &path)?;
        Some(path)
      }
      None => var("COOKIES_FILE").and_then(|path| existing_file(path.into())),
    };

    Ok(config)
  }

  pub fn socket_addr(&self) -> SocketAddr {
    SocketAddr::new(self.host, self.port)
  }
}

fn write_cookie_file(blob: &str, path: &Path) -> Result<()> {
  let cleaned: String = blob.split_whitespace().collect();
  let bytes = STANDARD
    .decode(cleaned)
    .map_err(|e| Error::Config(format!("COOKIES_BASE64: {e}")))?;

  std::fs::write(path, bytes).map_err(|e| {
    Error::Config(format!("writing cookie file {}: {e}", path.display()))
  })?;
  info!("cookie file written to {}", path.display());

  Ok(())
}

fn existing_file(path: PathBuf) -> Option<PathBuf> {
  if path.is_file() {
    info!("using cookie file {}", path.display());
    Some(path)
  } else {
    warn!("cookie file {} not found, ignoring", path.display());
    None
  }
}

// used to remove cred info from proxy url before printing
pub fn redact_proxy(proxy: &str) -> String {
  static AUTH_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"//[^:@/]+(:[^@/]+)?@").unwrap());
  AUTH_REGEX.replace(proxy, "//<REDACTED>@").into_owned()
}
