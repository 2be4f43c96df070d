use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::Result;

const PREFIX: &str = "ytdl-";

/// A per-request working directory, removed from disk when dropped.
///
/// Removal failures are logged and otherwise ignored: by the time the
/// directory goes away the response has already been decided.
#[derive(Debug)]
pub struct WorkDir {
  path: PathBuf,
  dir: Option<TempDir>,
}

impl WorkDir {
  pub fn create(root: &Path) -> Result<Self> {
    let dir = tempfile::Builder::new().prefix(PREFIX).tempdir_in(root)?;
    let path = dir.path().to_path_buf();
    debug!("created working directory {}", path.display());

    Ok(Self {
      path,
      dir: Some(dir),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for WorkDir {
  fn drop(&mut self) {
    let Some(dir) = self.dir.take() else {
      return;
    };

    match dir.close() {
      Ok(()) => debug!("removed working directory {}", self.path.display()),
      Err(e) => warn!(
        "failed to remove working directory {}: {}",
        self.path.display(),
        e
      ),
    }
  }
}
