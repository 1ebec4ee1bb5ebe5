//! The tenant-scoped storage layer.
//!
//! A [`Store`] is a filesystem-like capability rooted inside one
//! tenant's namespace. It resolves `(database, table)` pairs to signed
//! [`Index`] files, lists tables, and opens the backing objects that a
//! table's [`Blob`]s reference. [`DirStore`] is the directory-tree
//! implementation used by tests and single-node deployments.

#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

mod blob;
mod index;
mod store;
mod tenant;

pub use blob::{Blob, BlobStat, CompressedBlob, CompressedPart, OpaqueBlob};
pub use index::{Index, ObjectDesc};
pub use store::{blobs, DirStore, ObjectSource, Store, UploadFs};
pub use tenant::{Tenant, TenantKey};

#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "index for {db}/{table} not found")]
    IndexNotFound { db: String, table: String },
    #[display(fmt = "database \"{_0}\" not found")]
    DbNotFound(String),
    #[display(fmt = "index signature mismatch")]
    BadSignature,
    #[display(fmt = "invalid index encoding")]
    BadIndex,
    #[display(fmt = "invalid blob encoding")]
    BadBlob,
    #[display(fmt = "error reading store")]
    Io,
    #[display(fmt = "tenant root cannot be used for reading")]
    BadRoot,
}

impl error_stack::Context for Error {}
