use crate::errors::BufferError;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Whether [`MappedRegion::create_or_attach`] made a new segment or joined one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    Created,
    Attached,
}

/// A named, fixed-size shared memory segment backed by a file in the shm directory.
///
/// Closing only drops this process's mapping; the segment stays alive for
/// other attachers until someone calls [`MappedRegion::unlink`].
pub struct MappedRegion {
    name: String,
    path: PathBuf,
    size: usize,
    mmap: Option<MmapMut>,
}

impl MappedRegion {
    /// Create a new segment of `size` bytes, zero-filled.
    ///
    /// Fails with [`BufferError::AlreadyExists`] when the name is taken.
    pub fn create(dir: &Path, name: &str, size: usize) -> Result<Self, BufferError> {
        let path = dir.join(name);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BufferError::AlreadyExists(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        file.set_len(size as u64)?;
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        tracing::debug!(region = name, size, "Created shared memory region");

        Ok(Self {
            name: name.to_string(),
            path,
            size,
            mmap: Some(mmap),
        })
    }

    /// Attach read/write to an existing segment, sized by what the creator allocated.
    ///
    /// A zero-length file is a creator that has not finished `set_len` yet and is
    /// reported as [`BufferError::NotFound`].
    pub fn attach(dir: &Path, name: &str) -> Result<Self, BufferError> {
        let path = dir.join(name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BufferError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(BufferError::NotFound(name.to_string()));
        }

        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        tracing::debug!(region = name, size, "Attached to shared memory region");

        Ok(Self {
            name: name.to_string(),
            path,
            size,
            mmap: Some(mmap),
        })
    }

    /// Create the segment, or attach when another process already created it.
    ///
    /// An existing segment of a different size belongs to someone else and is
    /// never replaced: the caller gets `SizeMismatch` and the segment is left
    /// untouched.
    pub fn create_or_attach(
        dir: &Path,
        name: &str,
        size: usize,
    ) -> Result<(Self, Opened), BufferError> {
        match Self::create(dir, name, size) {
            Ok(region) => return Ok((region, Opened::Created)),
            Err(BufferError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        match Self::attach(dir, name) {
            Ok(region) if region.size() == size => Ok((region, Opened::Attached)),
            Ok(existing) => {
                tracing::warn!(
                    region = name,
                    expected = size,
                    actual = existing.size(),
                    "Existing shared memory region has an unexpected size"
                );
                Err(BufferError::SizeMismatch {
                    expected: size,
                    actual: existing.size(),
                })
            }
            // Lost a race with a concurrent unlink or an unfinished creator
            Err(BufferError::NotFound(_)) => Ok((Self::create(dir, name, size)?, Opened::Created)),
            Err(e) => Err(e),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.mmap.is_none()
    }

    pub fn bytes(&self) -> Result<&[u8], BufferError> {
        self.mmap
            .as_deref()
            .ok_or_else(|| BufferError::Closed(self.name.clone()))
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8], BufferError> {
        self.mmap
            .as_deref_mut()
            .ok_or_else(|| BufferError::Closed(self.name.clone()))
    }

    /// Drop this process's mapping. Always succeeds; calling it again is a no-op.
    pub fn close(&mut self) {
        if self.mmap.take().is_some() {
            tracing::debug!(region = %self.name, "Closed shared memory region");
        }
    }

    /// Close, then destroy the segment. An already-removed segment is not an error.
    pub fn unlink(&mut self) -> Result<bool, BufferError> {
        self.close();
        remove_path(&self.path, &self.name)
    }

    /// Destroy a segment by name without attaching to it.
    pub fn remove(dir: &Path, name: &str) -> Result<bool, BufferError> {
        remove_path(&dir.join(name), name)
    }

    pub fn exists(dir: &Path, name: &str) -> bool {
        dir.join(name).exists()
    }
}

fn remove_path(path: &Path, name: &str) -> Result<bool, BufferError> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(region = name, "Unlinked shared memory region");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(region = name, "Shared memory region already unlinked");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
