use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use error_stack::{report, IntoReport, ResultExt};
use petrel_blockfmt::{DirUploader, SparseIndex, Uploader};
use tracing::debug;

use crate::blob::{Blob, CompressedBlob, OpaqueBlob};
use crate::{Error, Index, TenantKey};

/// Opens the raw bytes behind store-relative object paths.
pub trait ObjectSource: Send + Sync {
    fn open_object(
        &self,
        path: &str,
        offset: u64,
        len: u64,
    ) -> std::io::Result<Box<dyn Read + Send>>;
}

/// Creates upload sinks for new objects.
pub trait UploadFs: Send + Sync {
    fn create(&self, path: &str) -> std::io::Result<Box<dyn Uploader + Send>>;
}

/// A tenant's storage root.
///
/// Index loads take the tenant key so a store holding another tenant's
/// files cannot satisfy the request.
pub trait Store: ObjectSource {
    fn open_partial_index(
        &self,
        db: &str,
        table: &str,
        key: &TenantKey,
    ) -> error_stack::Result<Index, Error>;

    fn list_tables(&self, db: &str) -> error_stack::Result<Vec<String>, Error>;

    /// The upload side of this store, if it has one.
    fn uploader(&self) -> Option<&dyn UploadFs> {
        None
    }
}

/// Materialise the blobs of an index, dropping block-structured objects
/// whose every block `keep` eliminates.
pub fn blobs(index: &Index, keep: Option<&dyn Fn(&SparseIndex, usize) -> bool>) -> Vec<Blob> {
    let mut out = Vec::new();
    for desc in &index.contents {
        match &desc.trailer {
            None => out.push(Blob::Opaque(OpaqueBlob {
                path: desc.path.clone(),
                etag: desc.etag.clone(),
                size: desc.size,
            })),
            Some(trailer) => {
                if let Some(keep) = keep {
                    let survives =
                        (0..trailer.blocks.len()).any(|i| keep(&trailer.sparse, i));
                    if !survives {
                        continue;
                    }
                }
                out.push(Blob::Compressed(Arc::new(CompressedBlob {
                    path: desc.path.clone(),
                    etag: desc.etag.clone(),
                    size: desc.size,
                    trailer: Arc::new(trailer.clone()),
                })));
            }
        }
    }
    out
}

/// A store rooted in a directory tree.
///
/// Layout: `db/<database>/<table>/index` holds the signed index; object
/// paths in descriptors are relative to the root.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self, db: &str, table: &str) -> PathBuf {
        self.root.join("db").join(db).join(table).join("index")
    }

    /// Sign and atomically publish an index.
    pub fn write_index(&self, index: &Index, key: &TenantKey) -> error_stack::Result<(), Error> {
        let path = self.index_path(&index.db, &index.table);
        let dir = path.parent().expect("index path has a parent");
        std::fs::create_dir_all(dir)
            .into_report()
            .change_context(Error::Io)?;
        let signed = index.sign(key);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .into_report()
            .change_context(Error::Io)?;
        std::io::Write::write_all(&mut tmp, &signed)
            .into_report()
            .change_context(Error::Io)?;
        tmp.persist(&path)
            .map_err(|e| report!(e.error))
            .change_context(Error::Io)?;
        debug!(db = %index.db, table = %index.table, "index published");
        Ok(())
    }
}

impl ObjectSource for DirStore {
    fn open_object(
        &self,
        path: &str,
        offset: u64,
        len: u64,
    ) -> std::io::Result<Box<dyn Read + Send>> {
        let mut file = std::fs::File::open(self.root.join(path))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(file.take(len)))
    }
}

impl Store for DirStore {
    fn open_partial_index(
        &self,
        db: &str,
        table: &str,
        key: &TenantKey,
    ) -> error_stack::Result<Index, Error> {
        let path = self.index_path(db, table);
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                report!(Error::IndexNotFound {
                    db: db.to_owned(),
                    table: table.to_owned(),
                })
            } else {
                report!(e).change_context(Error::Io)
            }
        })?;
        let index = Index::open_signed(&bytes, key)?;
        if index.db != db || index.table != table {
            return Err(report!(Error::BadIndex).attach_printable(format!(
                "index names {}/{}, expected {db}/{table}",
                index.db, index.table
            )));
        }
        Ok(index)
    }

    fn list_tables(&self, db: &str) -> error_stack::Result<Vec<String>, Error> {
        let dir = self.root.join("db").join(db);
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                report!(Error::DbNotFound(db.to_owned()))
            } else {
                report!(e).change_context(Error::Io)
            }
        })?;
        let mut tables = Vec::new();
        for entry in entries {
            let entry = entry.into_report().change_context(Error::Io)?;
            if entry.path().join("index").is_file() {
                tables.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        tables.sort();
        Ok(tables)
    }

    fn uploader(&self) -> Option<&dyn UploadFs> {
        Some(self)
    }
}

impl UploadFs for DirStore {
    fn create(&self, path: &str) -> std::io::Result<Box<dyn Uploader + Send>> {
        let full = self.root.join(path);
        let dir = full
            .parent()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
            })?
            .to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let name = full
            .file_name()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
            })?
            .to_string_lossy()
            .into_owned();
        Ok(Box::new(DirUploader::new(dir, name)))
    }
}
