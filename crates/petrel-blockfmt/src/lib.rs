//! The block-structured object format of the ingestion path.
//!
//! Objects are written as a sequence of compressed blocks, each holding a
//! whole number of fixed-alignment chunks of encoded rows, followed by a
//! [`Trailer`] describing block locations, compression, and per-block
//! min/max summaries of the indexed fields (the [`SparseIndex`]).
//!
//! The [`Converter`] is the write path: it turns a batch of
//! heterogeneous input streams (JSON variants, raw row pass-through)
//! into one such object, in parallel, and commits the trailer only when
//! every stream converted. Query-path block reading lives elsewhere;
//! this crate only decodes enough to re-chunk an object that is being
//! concatenated onto ([`Decoder`]).

#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

mod chunker;
mod compr;
mod compress;
mod convert;
mod decoder;
mod error;
mod json;
mod prefetch;
mod sparse;
mod trailer;
mod upload;

pub use chunker::{BlockWriter, Chunker};
pub use compr::Compression;
pub use compress::{CompressionWriter, LaneOutput, MultiWriter};
pub use convert::{
    cloudtrail_json, raw_rows, suffix_format, Converter, Input, Prepend, RowFormat,
};
pub use decoder::Decoder;
pub use error::{is_fatal, Error};
pub use json::Hints;
pub use sparse::{FieldPath, FieldRanges, RangeSet, SparseIndex, TimeRange};
pub use trailer::{BlockDesc, Trailer};
pub use upload::{share, DirUploader, MemHandle, MemUploader, SharedUploader, Uploader};
