use std::io::Read;
use std::sync::Arc;

use error_stack::{report, ResultExt};
use petrel_blockfmt::Trailer;
use petrel_wire::{Buffer, Symtab};

use crate::store::ObjectSource;
use crate::Error;

/// Identity and size of a blob, as reported by [`Blob::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobStat {
    pub size: u64,
    pub etag: String,
}

/// A backing object with no block structure we can exploit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueBlob {
    pub path: String,
    pub etag: String,
    pub size: u64,
}

/// A block-structured object: the trailer exposes block boundaries and
/// the sparse index, which makes range splitting and predicate pushdown
/// possible.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedBlob {
    pub path: String,
    pub etag: String,
    /// Total object size, trailer included.
    pub size: u64,
    pub trailer: Arc<Trailer>,
}

/// A slice of a [`CompressedBlob`] covering blocks
/// `[start_block, end_block)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedPart {
    pub parent: Arc<CompressedBlob>,
    pub start_block: usize,
    pub end_block: usize,
}

/// Any reference to a backing object.
#[derive(Debug, Clone, PartialEq)]
pub enum Blob {
    Opaque(OpaqueBlob),
    Compressed(Arc<CompressedBlob>),
    Part(CompressedPart),
}

impl CompressedPart {
    /// Slice `parent` into parts of at most `target` compressed bytes
    /// (always at least one block per part).
    pub fn split(parent: &Arc<CompressedBlob>, target: u64) -> Vec<CompressedPart> {
        let mut parts = Vec::new();
        let blocks = parent.trailer.blocks.len();
        let mut start = 0usize;
        let mut acc = 0u64;
        for i in 0..blocks {
            let size = parent.trailer.block_size(i);
            if acc > 0 && acc + size > target {
                parts.push(CompressedPart {
                    parent: parent.clone(),
                    start_block: start,
                    end_block: i,
                });
                start = i;
                acc = 0;
            }
            acc += size;
        }
        if start < blocks {
            parts.push(CompressedPart {
                parent: parent.clone(),
                start_block: start,
                end_block: blocks,
            });
        }
        parts
    }

    /// Compressed byte range `[start, end)` this part covers within the
    /// parent's data region.
    pub fn byte_range(&self) -> (u64, u64) {
        let t = &self.parent.trailer;
        let start = t.blocks[self.start_block].offset;
        let end = t
            .blocks
            .get(self.end_block)
            .map(|b| b.offset)
            .unwrap_or(t.offset);
        (start, end)
    }
}

impl Blob {
    pub fn path(&self) -> &str {
        match self {
            Blob::Opaque(b) => &b.path,
            Blob::Compressed(b) => &b.path,
            Blob::Part(p) => &p.parent.path,
        }
    }

    pub fn stat(&self) -> BlobStat {
        match self {
            Blob::Opaque(b) => BlobStat {
                size: b.size,
                etag: b.etag.clone(),
            },
            Blob::Compressed(b) => BlobStat {
                size: b.size,
                etag: b.etag.clone(),
            },
            Blob::Part(p) => {
                let (start, end) = p.byte_range();
                BlobStat {
                    size: end - start,
                    // The part's identity must be stable wherever the
                    // parent's identity is: peers derive ownership from
                    // this string.
                    etag: format!("{}#{}-{}", p.parent.etag, p.start_block, p.end_block),
                }
            }
        }
    }

    /// Open the compressed byte stream backing this blob.
    pub fn open(&self, src: &dyn ObjectSource) -> std::io::Result<Box<dyn Read + Send>> {
        match self {
            Blob::Opaque(b) => src.open_object(&b.path, 0, b.size),
            Blob::Compressed(b) => src.open_object(&b.path, 0, b.size),
            Blob::Part(p) => {
                let (start, end) = p.byte_range();
                src.open_object(&p.parent.path, start, end - start)
            }
        }
    }

    pub fn encode(&self, st: &mut Symtab, buf: &mut Buffer) {
        match self {
            Blob::Opaque(b) => {
                buf.begin_struct();
                buf.begin_field(st.intern("path"));
                buf.write_string(&b.path);
                buf.begin_field(st.intern("etag"));
                buf.write_string(&b.etag);
                buf.begin_field(st.intern("size"));
                buf.write_int(b.size as i64);
                buf.end_struct();
            }
            Blob::Compressed(b) => {
                buf.begin_struct();
                buf.begin_field(st.intern("path"));
                buf.write_string(&b.path);
                buf.begin_field(st.intern("etag"));
                buf.write_string(&b.etag);
                buf.begin_field(st.intern("size"));
                buf.write_int(b.size as i64);
                buf.begin_field(st.intern("trailer"));
                b.trailer.encode(buf);
                buf.end_struct();
            }
            Blob::Part(p) => {
                buf.begin_struct();
                buf.begin_field(st.intern("parent"));
                Blob::Compressed(p.parent.clone()).encode(st, buf);
                buf.begin_field(st.intern("start"));
                buf.write_int(p.start_block as i64);
                buf.begin_field(st.intern("end"));
                buf.write_int(p.end_block as i64);
                buf.end_struct();
            }
        }
    }

    pub fn decode<'a>(st: &Symtab, body: &'a [u8]) -> error_stack::Result<(Self, &'a [u8]), Error> {
        let mut path = None;
        let mut etag = None;
        let mut size = 0u64;
        let mut trailer = None;
        let mut parent = None;
        let mut start = None;
        let mut end = None;
        let mut nested_err = None;
        let rest = petrel_wire::unpack_struct(body, st, |name, value| {
            match name {
                "path" => {
                    let (v, _) = petrel_wire::read_string(value)?;
                    path = Some(v.to_owned());
                }
                "etag" => {
                    let (v, _) = petrel_wire::read_string(value)?;
                    etag = Some(v.to_owned());
                }
                "size" => {
                    let (v, _) = petrel_wire::read_int(value)?;
                    size = v as u64;
                }
                "trailer" => match Trailer::decode(value) {
                    Ok((t, _)) => trailer = Some(t),
                    Err(e) => nested_err = Some(e.change_context(Error::BadBlob)),
                },
                "parent" => match Blob::decode(st, value) {
                    Ok((Blob::Compressed(b), _)) => parent = Some(b),
                    Ok(_) => nested_err = Some(report!(Error::BadBlob)),
                    Err(e) => nested_err = Some(e),
                },
                "start" => {
                    let (v, _) = petrel_wire::read_int(value)?;
                    start = Some(v as usize);
                }
                "end" => {
                    let (v, _) = petrel_wire::read_int(value)?;
                    end = Some(v as usize);
                }
                _ => {}
            }
            Ok(())
        })
        .change_context(Error::BadBlob)?;
        if let Some(e) = nested_err {
            return Err(e);
        }
        let blob = match (parent, start, end) {
            (Some(parent), Some(start_block), Some(end_block)) => {
                if end_block < start_block || end_block > parent.trailer.blocks.len() {
                    return Err(report!(Error::BadBlob)
                        .attach_printable(format!("block range {start_block}..{end_block}")));
                }
                Blob::Part(CompressedPart {
                    parent,
                    start_block,
                    end_block,
                })
            }
            (None, None, None) => {
                let path = path.ok_or_else(|| report!(Error::BadBlob))?;
                let etag = etag.ok_or_else(|| report!(Error::BadBlob))?;
                match trailer {
                    Some(t) => Blob::Compressed(Arc::new(CompressedBlob {
                        path,
                        etag,
                        size,
                        trailer: Arc::new(t),
                    })),
                    None => Blob::Opaque(OpaqueBlob { path, etag, size }),
                }
            }
            _ => return Err(report!(Error::BadBlob)),
        };
        Ok((blob, rest))
    }

    /// Encode a blob list as `[blob…]`.
    pub fn encode_list(blobs: &[Blob], st: &mut Symtab, buf: &mut Buffer) {
        buf.begin_list();
        for blob in blobs {
            blob.encode(st, buf);
        }
        buf.end_list();
    }

    /// Decode a list written by [`Blob::encode_list`], returning the
    /// remaining input.
    pub fn decode_list<'a>(
        st: &Symtab,
        body: &'a [u8],
    ) -> error_stack::Result<(Vec<Blob>, &'a [u8]), Error> {
        let mut out = Vec::new();
        let mut nested_err = None;
        let rest = petrel_wire::unpack_list(body, |item| {
            match Blob::decode(st, item) {
                Ok((blob, _)) => out.push(blob),
                Err(e) => {
                    if nested_err.is_none() {
                        nested_err = Some(e);
                    }
                }
            }
            Ok(())
        })
        .change_context(Error::BadBlob)?;
        if let Some(e) = nested_err {
            return Err(e);
        }
        Ok((out, rest))
    }
}
