use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Destination for a multi-part object upload.
///
/// Parts may be uploaded out of order and from multiple writer lanes; the
/// committed object is the concatenation of all parts in part-number
/// order, followed by the bytes passed to [`Uploader::close`]. Nothing is
/// observable until `close` succeeds.
///
/// Implementations must tolerate parts smaller than
/// [`min_part_size`](Uploader::min_part_size) at the tail of a lane.
pub trait Uploader: Send {
    fn min_part_size(&self) -> usize;
    fn upload(&mut self, part: i64, contents: &[u8]) -> io::Result<()>;
    fn close(&mut self, final_bytes: &[u8]) -> io::Result<()>;
    /// Total committed size; valid once `close` has returned.
    fn size(&self) -> u64;
}

/// An uploader shared between concurrent writer lanes.
pub type SharedUploader = Arc<Mutex<Box<dyn Uploader + Send>>>;

pub fn share(uploader: Box<dyn Uploader + Send>) -> SharedUploader {
    Arc::new(Mutex::new(uploader))
}

#[derive(Default)]
struct MemState {
    parts: Vec<(i64, Vec<u8>)>,
    object: Option<Vec<u8>>,
}

/// An in-memory uploader; the committed object can be inspected through
/// the handle returned by [`MemUploader::handle`].
pub struct MemUploader {
    state: Arc<Mutex<MemState>>,
    min_part_size: usize,
}

#[derive(Clone)]
pub struct MemHandle {
    state: Arc<Mutex<MemState>>,
}

impl MemUploader {
    pub fn new() -> Self {
        Self::with_min_part_size(1 << 13)
    }

    pub fn with_min_part_size(min_part_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState::default())),
            min_part_size,
        }
    }

    pub fn handle(&self) -> MemHandle {
        MemHandle {
            state: self.state.clone(),
        }
    }
}

impl Default for MemUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl MemHandle {
    /// The committed object, or `None` if the upload never closed.
    pub fn object(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().object.clone()
    }
}

impl Uploader for MemUploader {
    fn min_part_size(&self) -> usize {
        self.min_part_size
    }

    fn upload(&mut self, part: i64, contents: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.object.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "upload after close",
            ));
        }
        state.parts.push((part, contents.to_vec()));
        Ok(())
    }

    fn close(&mut self, final_bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.parts.sort_by_key(|(part, _)| *part);
        let mut object = Vec::new();
        for (_, data) in state.parts.drain(..) {
            object.extend_from_slice(&data);
        }
        object.extend_from_slice(final_bytes);
        state.object = Some(object);
        Ok(())
    }

    fn size(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.object.as_ref().map(|o| o.len() as u64).unwrap_or(0)
    }
}

/// An uploader that publishes the object into a directory with an atomic
/// rename, so a torn write is never visible under the final name.
pub struct DirUploader {
    dir: PathBuf,
    name: String,
    parts: Vec<(i64, Vec<u8>)>,
    size: u64,
    min_part_size: usize,
}

impl DirUploader {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            parts: Vec::new(),
            size: 0,
            min_part_size: 1 << 13,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }
}

impl Uploader for DirUploader {
    fn min_part_size(&self) -> usize {
        self.min_part_size
    }

    fn upload(&mut self, part: i64, contents: &[u8]) -> io::Result<()> {
        self.parts.push((part, contents.to_vec()));
        Ok(())
    }

    fn close(&mut self, final_bytes: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.parts.sort_by_key(|(part, _)| *part);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        let mut written = 0u64;
        for (_, data) in self.parts.drain(..) {
            tmp.write_all(&data)?;
            written += data.len() as u64;
        }
        tmp.write_all(final_bytes)?;
        written += final_bytes.len() as u64;
        tmp.flush()?;
        let dst = self.dir.join(&self.name);
        tmp.persist(&dst).map_err(|e| e.error)?;
        self.size = written;
        debug!(path = %dst.display(), size = written, "object committed");
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_uploader_orders_parts() {
        let mut up = MemUploader::new();
        let handle = up.handle();
        up.upload(2, b"world").unwrap();
        up.upload(1, b"hello ").unwrap();
        assert_eq!(handle.object(), None);
        up.close(b"!").unwrap();
        assert_eq!(handle.object().unwrap(), b"hello world!");
        assert_eq!(up.size(), 12);
    }

    #[test]
    fn test_dir_uploader_publishes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut up = DirUploader::new(dir.path(), "packed");
        up.upload(0, b"abc").unwrap();
        assert!(!dir.path().join("packed").exists());
        up.close(b"def").unwrap();
        assert_eq!(std::fs::read(dir.path().join("packed")).unwrap(), b"abcdef");
    }
}
