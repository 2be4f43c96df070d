use std::{
  collections::VecDeque,
  ffi::OsString,
  io::ErrorKind,
  path::Path,
  process::{ExitStatus, Stdio},
  time::Duration,
};

use tokio::{
  io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
  process::Command,
  task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
  config::{Config, ExtractorCommand},
  request::{DownloadRequest, MediaFormat, Quality},
  Error, Result,
};

/// Upper bound on the diagnostic output kept from a failed run.
pub const MAX_DIAGNOSTIC_BYTES: usize = 4000;

/// How long to keep draining stderr after the tool has exited. A grandchild
/// still holding the pipe must not stall the request.
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(2);

const VIDEO_POSTPROCESSOR_ARGS: &str =
  "ffmpeg:-c:v copy -c:a aac -b:a 192k -movflags +faststart";

/// yt-dlp `-f` expression for a video download. Every chain ends in `best`
/// so some stream is always picked.
pub fn format_selector(quality: Quality) -> String {
  match quality {
    Quality::Height(h) => format!(
      "bestvideo[ext=mp4][height<={h}]+bestaudio[ext=m4a]\
       /bestvideo[height<={h}]+bestaudio\
       /best[height<={h}]\
       /best"
    ),
    Quality::Best => {
      "bestvideo[ext=mp4]+bestaudio[ext=m4a]/bestvideo+bestaudio/best".into()
    }
  }
}

pub fn build_args(
  request: &DownloadRequest,
  output_dir: &Path,
  config: &Config,
) -> Vec<OsString> {
  let mut args: Vec<OsString> = vec![];
  let mut push = |arg: &str| args.push(arg.into());

  match request.format {
    MediaFormat::Mp4 => {
      push("-f");
      push(&format_selector(request.quality));
      push("--merge-output-format");
      push("mp4");
      push("--postprocessor-args");
      push(VIDEO_POSTPROCESSOR_ARGS);
    }
    MediaFormat::Mp3 => {
      push("-f");
      push("bestaudio/best");
      push("-x");
      push("--audio-format");
      push("mp3");
      push("--audio-quality");
      push("0");
    }
  }

  push("--no-playlist");
  push("--no-progress");
  push("--no-mtime");
  push("--user-agent");
  push(&config.user_agent);
  push("--referer");
  push(&config.referer);

  if let Some(proxy) = &config.proxy {
    push("--proxy");
    push(proxy);
  }

  args.push("-o".into());
  args.push(output_dir.join("%(title)s.%(ext)s").into_os_string());

  if let Some(cookies) = &config.cookie_file {
    args.push("--cookies".into());
    args.push(cookies.clone().into_os_string());
  }

  args.push("--".into());
  args.push(request.url.as_str().into());
  args
}

/// Keeps the last `limit` bytes written to it.
#[derive(Debug)]
pub struct TailBuffer {
  buf: VecDeque<u8>,
  limit: usize,
}

impl TailBuffer {
  pub fn new(limit: usize) -> Self {
    Self {
      buf: VecDeque::with_capacity(limit.min(8192)),
      limit,
    }
  }

  pub fn push(&mut self, bytes: &[u8]) {
    let bytes = &bytes[bytes.len().saturating_sub(self.limit)..];
    let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.limit);
    self.buf.drain(..overflow);
    self.buf.extend(bytes);
  }

  /// Lossy UTF-8 rendition, still no longer than `limit` bytes.
  pub fn into_string(self) -> String {
    let bytes: Vec<u8> = self.buf.into();
    let text = String::from_utf8_lossy(&bytes);
    let text = text.trim();

    let mut start = text.len().saturating_sub(self.limit);
    while !text.is_char_boundary(start) {
      start += 1;
    }
    text[start..].trim_start().to_string()
  }
}

/// Run the extraction tool to completion, killing it once `timeout` elapses.
///
/// The child is killed if this future is dropped, so an abandoned request
/// never leaves the tool running.
pub async fn run(
  command: &ExtractorCommand,
  args: Vec<OsString>,
  timeout: Duration,
) -> Result<()> {
  let mut cmd = Command::new(&command.program);
  cmd
    .args(&command.leading_args)
    .args(args)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  // own process group, so ffmpeg children can be killed along with yt-dlp
  #[cfg(unix)]
  cmd.process_group(0);

  let mut child = cmd.spawn().map_err(|e| match e.kind() {
    ErrorKind::NotFound => Error::ExtractorMissing(command.program.clone()),
    _ => Error::Spawn(e),
  })?;

  debug!(pid = ?child.id(), "extraction tool started");
  let mut group = ProcessGroup::new(child.id());

  let stdout = child.stdout.take().map(|out| tokio::spawn(log_lines(out)));
  let mut stderr = child
    .stderr
    .take()
    .map(|err| tokio::spawn(collect_tail(err, MAX_DIAGNOSTIC_BYTES)));

  let waited = tokio::time::timeout(timeout, child.wait()).await;
  let status = match waited {
    Ok(status) => status?,
    Err(_) => {
      warn!(
        pid = ?child.id(),
        "extraction tool exceeded {}ms, killing",
        timeout.as_millis()
      );
      group.kill();
      if let Err(e) = child.kill().await {
        warn!("failed to kill extraction tool: {e}");
      }
      abort(&stdout);
      abort(&stderr);
      return Err(Error::Timeout(timeout));
    }
  };

  group.disarm();
  abort(&stdout);
  if status.success() {
    abort(&stderr);
    return Ok(());
  }

  let diagnostics = match stderr.as_mut() {
    Some(task) => match tokio::time::timeout(STDERR_DRAIN_GRACE, task).await {
      Ok(Ok(text)) => text,
      _ => String::new(),
    },
    None => String::new(),
  };
  abort(&stderr);

  Err(Error::ExtractorFailed {
    code: exit_code(&status),
    diagnostics,
  })
}

/// Kills the tool's whole process group when dropped while armed. Covers
/// the timeout path as well as a request future dropped mid-run.
struct ProcessGroup {
  pgid: Option<u32>,
}

impl ProcessGroup {
  fn new(pgid: Option<u32>) -> Self {
    Self { pgid }
  }

  fn disarm(&mut self) {
    self.pgid = None;
  }

  fn kill(&mut self) {
    let Some(pgid) = self.pgid.take() else {
      return;
    };

    #[cfg(unix)]
    {
      use nix::{
        errno::Errno,
        sys::signal::{killpg, Signal},
        unistd::Pid,
      };

      match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("failed to kill process group {pgid}: {e}"),
      }
    }

    #[cfg(not(unix))]
    let _ = pgid;
  }
}

impl Drop for ProcessGroup {
  fn drop(&mut self) {
    self.kill();
  }
}

fn abort<T>(task: &Option<JoinHandle<T>>) {
  if let Some(task) = task {
    task.abort();
  }
}

fn exit_code(status: &ExitStatus) -> String {
  if let Some(code) = status.code() {
    return code.to_string();
  }

  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
      return format!("signal {signal}");
    }
  }

  "unknown".into()
}

// Reads to EOF whatever the encoding: closing the pipe early would kill
// the tool with SIGPIPE on its next write.
async fn log_lines(out: impl AsyncRead + Unpin) {
  let mut reader = BufReader::new(out);
  let mut line = Vec::new();

  loop {
    line.clear();
    match reader.read_until(b'\n', &mut line).await {
      Ok(0) => break,
      Ok(_) => {
        let text = String::from_utf8_lossy(&line);
        debug!(
          target: "yt_download_server::ytdlp::stdout",
          "{}",
          text.trim_end()
        );
      }
      Err(e) => {
        debug!("stopped reading tool stdout: {e}");
        break;
      }
    }
  }
}

async fn collect_tail(err: impl AsyncRead + Unpin, limit: usize) -> String {
  let mut reader = BufReader::new(err);
  let mut tail = TailBuffer::new(limit);
  let mut chunk = [0u8; 4096];

  loop {
    match reader.read(&mut chunk).await {
      Ok(0) => break,
      Ok(n) => tail.push(&chunk[..n]),
      Err(e) => {
        debug!("stopped reading tool stderr: {e}");
        break;
      }
    }
  }

  tail.into_string()
}

#[cfg(test)]
mod test {
  use std::path::PathBuf;

  use super::*;
  use crate::request::DownloadParams;

  fn request(quality: &str, format: &str) -> DownloadRequest {
    DownloadRequest::from_params(DownloadParams {
      url: Some("https://www.youtube.com/watch?v=abc".into()),
      quality: Some(quality.into()),
      format: Some(format.into()),
    })
    .unwrap()
  }

  fn shell(script: &str) -> ExtractorCommand {
    ExtractorCommand {
      program: PathBuf::from("sh"),
      leading_args: vec!["-c".into(), script.into(), "yt-dlp".into()],
    }
  }

  fn strings(args: &[OsString]) -> Vec<String> {
    args
      .iter()
      .map(|a| a.to_string_lossy().into_owned())
      .collect()
  }

  #[test]
  fn test_format_selector_with_height() {
    assert_eq!(
      format_selector(Quality::Height(720)),
      "bestvideo[ext=mp4][height<=720]+bestaudio[ext=m4a]\
       /bestvideo[height<=720]+bestaudio/best[height<=720]/best"
    );
  }

  #[test]
  fn test_unknown_quality_matches_best() {
    let unknown = format_selector(Quality::parse(Some("999")));
    let omitted = format_selector(Quality::parse(None));
    assert_eq!(unknown, omitted);
    assert!(!omitted.contains("height"));
    assert!(omitted.ends_with("/best"));
  }

  #[test]
  fn test_video_args() {
    let config = Config {
      cookie_file: Some(PathBuf::from("/tmp/cookies.txt")),
      ..Default::default()
    };
    let args = strings(&build_args(
      &request("1080", "mp4"),
      Path::new("/work/ytdl-1"),
      &config,
    ));

    let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
    assert!(args[pos("-f") + 1].contains("height<=1080"));
    assert_eq!(args[pos("--merge-output-format") + 1], "mp4");
    assert_eq!(
      args[pos("--postprocessor-args") + 1],
      VIDEO_POSTPROCESSOR_ARGS
    );
    assert_eq!(args[pos("-o") + 1], "/work/ytdl-1/%(title)s.%(ext)s");
    assert_eq!(args[pos("--cookies") + 1], "/tmp/cookies.txt");
    assert_eq!(args[pos("--user-agent") + 1], config.user_agent);
    assert_eq!(args[pos("--referer") + 1], config.referer);
    assert!(args.contains(&"--no-playlist".to_string()));
    assert!(!args.contains(&"--proxy".to_string()));
    assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=abc");
  }

  #[test]
  fn test_audio_args() {
    let config = Config {
      proxy: Some("socks5://proxy:1080".into()),
      ..Default::default()
    };
    let args = strings(&build_args(
      &request("best", "mp3"),
      Path::new("/work"),
      &config,
    ));

    let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
    assert_eq!(args[pos("-f") + 1], "bestaudio/best");
    assert!(args.contains(&"-x".to_string()));
    assert_eq!(args[pos("--audio-format") + 1], "mp3");
    assert_eq!(args[pos("--audio-quality") + 1], "0");
    assert_eq!(args[pos("--proxy") + 1], "socks5://proxy:1080");
    assert!(!args.contains(&"--cookies".to_string()));
    assert!(!args.contains(&"--merge-output-format".to_string()));
  }

  #[test]
  fn test_tail_buffer() {
    let mut tail = TailBuffer::new(5);
    tail.push(b"abc");
    tail.push(b"defg");
    assert_eq!(tail.into_string(), "cdefg");

    let mut tail = TailBuffer::new(3);
    tail.push(b"0123456789");
    assert_eq!(tail.into_string(), "789");

    let mut tail = TailBuffer::new(10);
    tail.push(b"short");
    assert_eq!(tail.into_string(), "short");
  }

  #[test]
  fn test_tail_buffer_invalid_utf8_stays_bounded() {
    let mut tail = TailBuffer::new(4000);
    tail.push(&[0xff; 10000]);
    let text = tail.into_string();
    assert!(!text.is_empty());
    assert!(text.len() <= 4000);

    // "é" is two bytes, the cut lands in the middle of the first one
    let mut tail = TailBuffer::new(5);
    tail.push("éé!!".as_bytes());
    tail.push(b"ab");
    let text = tail.into_string();
    assert!(text.len() <= 5);
    assert_eq!(text, "!!ab");

    let mut tail = TailBuffer::new(6);
    tail.push(b"x");
    tail.push(&"é".as_bytes()[1..]);
    tail.push(b"ERROR");
    assert_eq!(tail.into_string(), "ERROR");
  }

  #[tokio::test]
  async fn test_run_success() {
    let res = run(&shell("exit 0"), vec![], Duration::from_secs(5)).await;
    assert!(res.is_ok());
  }

  #[tokio::test]
  async fn test_run_failure_keeps_tail_of_stderr() {
    let script = r#"i=0
while [ $i -lt 2000 ]; do echo "noise line $i" >&2; i=$((i+1)); done
echo "ERROR: Video unavailable" >&2
exit 1"#;
    let err = run(&shell(script), vec![], Duration::from_secs(10))
      .await
      .unwrap_err();

    match err {
      Error::ExtractorFailed { code, diagnostics } => {
        assert_eq!(code, "1");
        assert!(diagnostics.len() <= MAX_DIAGNOSTIC_BYTES);
        assert!(diagnostics.ends_with("ERROR: Video unavailable"));
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[tokio::test]
  async fn test_run_timeout_kills() {
    let started = std::time::Instant::now();
    let err = run(&shell("exec sleep 30"), vec![], Duration::from_millis(200))
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(10));
  }

  #[tokio::test]
  async fn test_run_drains_non_utf8_stdout() {
    let script = "printf 'title \\377\\n'; \
      head -c 300000 /dev/zero | tr '\\0' a; echo; exit 0";
    let res = run(&shell(script), vec![], Duration::from_secs(10)).await;
    assert!(res.is_ok(), "{res:?}");
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_run_timeout_kills_grandchildren() {
    let marker = tempfile::tempdir().unwrap();
    let late = marker.path().join("late");
    let script = format!("(sleep 1; touch '{}') & wait", late.display());

    let err = run(&shell(&script), vec![], Duration::from_millis(200))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!late.exists());
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_run_not_executable() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("yt-dlp");
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
      .unwrap();

    let err = run(&ExtractorCommand::new(&path), vec![], Duration::from_secs(1))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Spawn(_)), "{err}");
    assert_eq!(err.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    assert!(err.to_string().starts_with("failed to start extraction tool"));
  }

  #[tokio::test]
  async fn test_run_missing_binary() {
    let command = ExtractorCommand::new("/nonexistent/yt-dlp-binary");
    let err = run(&command, vec![], Duration::from_secs(1))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::ExtractorMissing(_)));
  }
}
