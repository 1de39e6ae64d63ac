//! Process-wide temporary directory
//!
//! Holds the per-container host directories (socket mount points) and
//! one-shot file copies handed to containers. Everything beneath the base
//! is removed when the owning supervisor drops it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context};
use log::{debug, error};

use crate::Result;

static FILE_COPY_COUNT: AtomicUsize = AtomicUsize::new(1);

pub struct TmpDir {
    base: PathBuf,
}

impl TmpDir {
    pub fn new() -> Result<Self> {
        let base = std::env::temp_dir().join(format!("ioduel-{}", std::process::id()));
        fs::create_dir_all(&base)
            .with_context(|| format!("failed to create temporary directory {}", base.display()))?;
        debug!("temporary base directory: {}", base.display());
        Ok(TmpDir { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Host-side directory mounted into the named container.
    pub fn container_dir(&self, container_name: &str) -> Result<PathBuf> {
        let dir = self.base.join(container_name);
        if dir.is_dir() {
            return Ok(dir);
        }
        fs::create_dir_all(&dir).with_context(|| {
            format!("failed to create container directory {}", dir.display())
        })?;
        Ok(dir)
    }

    /// Unique copy of `original`, for files a container must see privately.
    pub fn file_copy(&self, original: &Path) -> Result<PathBuf> {
        if !original.is_file() {
            bail!("\"{}\" is not a regular file", original.display());
        }
        let file_name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let copy = self.base.join(format!(
            "{}{}",
            file_name,
            FILE_COPY_COUNT.fetch_add(1, Ordering::Relaxed)
        ));
        fs::copy(original, &copy).with_context(|| {
            format!(
                "failed to copy \"{}\" to \"{}\"",
                original.display(),
                copy.display()
            )
        })?;
        Ok(copy)
    }
}

impl Drop for TmpDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.base) {
            error!(
                "failed to delete temporary directory \"{}\": {}",
                self.base.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_container_dir_created_once() {
        let tmpdir = TmpDir::new().unwrap();
        let a = tmpdir.container_dir("kv_0").unwrap();
        let b = tmpdir.container_dir("kv_0").unwrap();
        assert_eq!(a, b);
        assert!(a.is_dir());
    }

    #[test]
    fn test_file_copy_is_unique() {
        let tmpdir = TmpDir::new().unwrap();
        let src = tmpdir.base().join("options.ini");
        let mut f = fs::File::create(&src).unwrap();
        writeln!(f, "x=1").unwrap();

        let c1 = tmpdir.file_copy(&src).unwrap();
        let c2 = tmpdir.file_copy(&src).unwrap();
        assert_ne!(c1, c2);
        assert!(c1.is_file() && c2.is_file());
    }

    #[test]
    fn test_base_removed_on_drop() {
        let tmpdir = TmpDir::new().unwrap();
        let base = tmpdir.base().to_path_buf();
        tmpdir.container_dir("load_0").unwrap();
        drop(tmpdir);
        assert!(!base.exists());
    }
}
