use std::{
  io,
  pin::Pin,
  task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tracing::{debug, warn};

use super::WorkDir;

/// Response body for a downloaded file. Owns the working directory the file
/// lives in, so the directory is removed once the body finishes, fails or is
/// dropped because the client went away.
pub struct ByteStream<T> {
  // declared first so the file handle closes before the directory goes
  stream: T,
  name: String,
  sent_bytes: u64,
  total_bytes: u64,
  _work_dir: WorkDir,
}

impl<T> ByteStream<T> {
  pub fn new(stream: T, work_dir: WorkDir) -> Self {
    ByteStream {
      stream,
      name: String::new(),
      sent_bytes: 0,
      total_bytes: 0,
      _work_dir: work_dir,
    }
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn total_bytes(mut self, bytes: u64) -> Self {
    self.total_bytes = bytes;
    self
  }
}

impl<T> Stream for ByteStream<T>
where
  T: Stream<Item = io::Result<Bytes>> + Unpin,
{
  type Item = io::Result<Bytes>;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    let this = &mut *self;
    let poll = Pin::new(&mut this.stream).poll_next(cx);
    match poll {
      Poll::Ready(Some(Ok(bytes))) => {
        this.sent_bytes += bytes.len() as u64;
        Poll::Ready(Some(Ok(bytes)))
      }
      Poll::Ready(Some(Err(err))) => {
        // headers are already out, all we can do is cut the body short
        warn!("error streaming {}: {}", this.name, err);
        Poll::Ready(Some(Err(err)))
      }
      Poll::Ready(None) => Poll::Ready(None),
      Poll::Pending => Poll::Pending,
    }
  }
}

impl<T> Drop for ByteStream<T> {
  fn drop(&mut self) {
    if self.sent_bytes < self.total_bytes {
      debug!(
        "body for {} closed early after {}/{} bytes",
        self.name, self.sent_bytes, self.total_bytes
      );
    } else {
      debug!("sent {} ({} bytes)", self.name, self.sent_bytes);
    }
  }
}
