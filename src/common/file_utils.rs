//! Positional file I/O for page-oriented files.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{DbError, Result};

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// An open database file plus its path. Temporary in-memory files carry no
/// backing `File`; their pages live only in buffer manager frames.
#[derive(Debug)]
pub struct FileInfo {
    path: PathBuf,
    file: Option<File>,
}

impl FileInfo {
    pub fn open(path: &Path, create_if_not_exists: bool, read_only: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        if read_only {
            options.read(true);
        } else {
            options.read(true).write(true);
        }
        if create_if_not_exists {
            options.create(true);
        }
        let file = options.open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// A handle for a temporary in-memory file. All I/O through it fails;
    /// callers must keep such pages pinned in frames instead.
    pub fn new_in_mem(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_in_mem(&self) -> bool {
        self.file.is_none()
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| {
            DbError::InvalidArgument(format!(
                "no disk I/O on in-memory file {}",
                self.path.display()
            ))
        })
    }

    /// Reads `buf.len()` bytes starting at `offset`. Bytes past the end of
    /// the file read as zero: pages are created in frames before they are
    /// ever written out, so the file may legitimately be shorter than its
    /// logical page count.
    pub fn read_from_file(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let file = self.file()?;
        let mut total = 0usize;
        while total < buf.len() {
            #[cfg(unix)]
            let n = file.read_at(&mut buf[total..], offset + total as u64)?;
            #[cfg(windows)]
            let n = file.seek_read(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                buf[total..].fill(0);
                break;
            }
            total += n;
        }
        Ok(())
    }

    pub fn write_to_file(&self, buf: &[u8], offset: u64) -> Result<()> {
        let file = self.file()?;
        let mut total = 0usize;
        while total < buf.len() {
            #[cfg(unix)]
            let n = file.write_at(&buf[total..], offset + total as u64)?;
            #[cfg(windows)]
            let n = file.seek_write(&buf[total..], offset + total as u64)?;
            if n == 0 {
                return Err(DbError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short write to {}", self.path.display()),
                )));
            }
            total += n;
        }
        Ok(())
    }

    pub fn truncate(&self, num_bytes: u64) -> Result<()> {
        Ok(self.file()?.set_len(num_bytes)?)
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    pub fn sync(&self) -> Result<()> {
        Ok(self.file()?.sync_data()?)
    }
}
