use chrono::{DateTime, Utc};
use error_stack::{report, ResultExt};
use petrel_wire::{Buffer, Symtab};

use crate::{Error, SparseIndex};

/// One compressed block of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDesc {
    /// Byte offset of the block within the object's data region.
    pub offset: u64,
    /// Number of aligned chunks the block decompresses to.
    pub chunks: u32,
}

/// The terminal metadata of a written object.
///
/// A trailer exists only for objects whose upload committed; the
/// converter never exposes one for a failed run.
#[derive(Debug, Clone, PartialEq)]
pub struct Trailer {
    pub version: u32,
    /// Name of the compression algorithm used for the data blocks.
    pub algo: String,
    /// Pre-compression chunk alignment in bytes; always a power of two.
    pub align: u32,
    /// Byte offset where the trailer region begins, i.e. the total size
    /// of the data region.
    pub offset: u64,
    pub blocks: Vec<BlockDesc>,
    pub sparse: SparseIndex,
    pub created: DateTime<Utc>,
}

impl Trailer {
    /// log2 of the chunk alignment; a block's decompressed size is
    /// `chunks << block_shift()`.
    pub fn block_shift(&self) -> u32 {
        self.align.trailing_zeros()
    }

    /// Total decompressed size of the object.
    pub fn decompressed(&self) -> u64 {
        let shift = self.block_shift();
        self.blocks.iter().map(|b| (b.chunks as u64) << shift).sum()
    }

    /// Compressed size of block `i`.
    pub fn block_size(&self, i: usize) -> u64 {
        let start = self.blocks[i].offset;
        let end = self
            .blocks
            .get(i + 1)
            .map(|b| b.offset)
            .unwrap_or(self.offset);
        end - start
    }

    pub fn encode(&self, buf: &mut Buffer) {
        buf.begin_struct();
        buf.begin_field_name("version");
        buf.write_int(self.version as i64);
        buf.begin_field_name("algo");
        buf.write_string(&self.algo);
        buf.begin_field_name("align");
        buf.write_int(self.align as i64);
        buf.begin_field_name("offset");
        buf.write_int(self.offset as i64);
        buf.begin_field_name("blocks");
        buf.begin_list();
        for b in &self.blocks {
            buf.begin_list();
            buf.write_int(b.offset as i64);
            buf.write_int(b.chunks as i64);
            buf.end_list();
        }
        buf.end_list();
        buf.begin_field_name("sparse");
        self.sparse.encode(buf);
        buf.begin_field_name("created");
        buf.write_timestamp(self.created);
        buf.end_struct();
    }

    pub fn decode(body: &[u8]) -> error_stack::Result<(Self, &[u8]), Error> {
        let empty = Symtab::new();
        let mut version = 0u32;
        let mut algo = String::new();
        let mut align = 0u32;
        let mut offset = 0u64;
        let mut blocks = Vec::new();
        let mut sparse = SparseIndex::default();
        let mut sparse_err = None;
        let mut created = None;
        let rest = petrel_wire::unpack_struct(body, &empty, |name, value| {
            match name {
                "version" => {
                    let (v, _) = petrel_wire::read_int(value)?;
                    version = v as u32;
                }
                "algo" => {
                    let (v, _) = petrel_wire::read_string(value)?;
                    algo = v.to_owned();
                }
                "align" => {
                    let (v, _) = petrel_wire::read_int(value)?;
                    align = v as u32;
                }
                "offset" => {
                    let (v, _) = petrel_wire::read_int(value)?;
                    offset = v as u64;
                }
                "blocks" => {
                    petrel_wire::unpack_list(value, |item| {
                        let body = petrel_wire::contents(item)?;
                        let (off, rest) = petrel_wire::read_int(body)?;
                        let (chunks, _) = petrel_wire::read_int(rest)?;
                        blocks.push(BlockDesc {
                            offset: off as u64,
                            chunks: chunks as u32,
                        });
                        Ok(())
                    })?;
                }
                "sparse" => match SparseIndex::decode(value) {
                    Ok((s, _)) => sparse = s,
                    Err(e) => sparse_err = Some(e),
                },
                "created" => {
                    let (v, _) = petrel_wire::read_timestamp(value)?;
                    created = Some(v);
                }
                _ => {}
            }
            Ok(())
        })
        .change_context(Error::BadTrailer)?;
        if let Some(e) = sparse_err {
            return Err(e);
        }
        if !align.is_power_of_two() {
            return Err(report!(Error::BadTrailer)
                .attach_printable(format!("alignment {align} is not a power of two")));
        }
        let created = created.ok_or_else(|| report!(Error::BadTrailer))?;
        Ok((
            Trailer {
                version,
                algo,
                align,
                offset,
                blocks,
                sparse,
                created,
            },
            rest,
        ))
    }

    /// Append this trailer to `dst` as an object footer: the encoded
    /// trailer followed by its length as a little-endian `u32`.
    pub fn append_footer(&self, dst: &mut Vec<u8>) {
        let mut buf = Buffer::new();
        self.encode(&mut buf);
        let encoded = buf.into_vec();
        let len = encoded.len() as u32;
        dst.extend_from_slice(&encoded);
        dst.extend_from_slice(&len.to_le_bytes());
    }

    /// Read a trailer back out of a complete object written with an
    /// [`append_footer`](Trailer::append_footer) footer.
    pub fn from_footer(object: &[u8]) -> error_stack::Result<Self, Error> {
        if object.len() < 4 {
            return Err(report!(Error::BadTrailer));
        }
        let mut le = [0u8; 4];
        le.copy_from_slice(&object[object.len() - 4..]);
        let len = u32::from_le_bytes(le) as usize;
        if len + 4 > object.len() {
            return Err(report!(Error::BadTrailer));
        }
        let body = &object[object.len() - 4 - len..object.len() - 4];
        let (trailer, rest) = Self::decode(body)?;
        petrel_wire::expect_consumed(rest).change_context(Error::BadTrailer)?;
        Ok(trailer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RangeSet;
    use chrono::TimeZone;

    fn sample() -> Trailer {
        let mut sparse = SparseIndex::default();
        let mut r = RangeSet::new();
        r.note(
            &vec!["ts".to_owned()],
            Utc.timestamp_opt(1000, 0).unwrap(),
        );
        sparse.push_block(&r);
        sparse.push_block(&RangeSet::new());
        Trailer {
            version: 1,
            algo: "zstd".to_owned(),
            align: 1 << 20,
            offset: 3000,
            blocks: vec![
                BlockDesc {
                    offset: 0,
                    chunks: 4,
                },
                BlockDesc {
                    offset: 1800,
                    chunks: 2,
                },
            ],
            sparse,
            created: Utc.timestamp_opt(1_686_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_decompressed_and_block_size() {
        let t = sample();
        assert_eq!(t.block_shift(), 20);
        assert_eq!(t.decompressed(), 6 << 20);
        assert_eq!(t.block_size(0), 1800);
        assert_eq!(t.block_size(1), 1200);
    }

    #[test]
    fn test_footer_round_trip() {
        let t = sample();
        let mut object = vec![0xaa; 64];
        t.append_footer(&mut object);
        let decoded = Trailer::from_footer(&object).unwrap();
        assert_eq!(decoded, t);
    }

    #[test]
    fn test_from_footer_rejects_short_object() {
        assert!(Trailer::from_footer(&[1, 2]).is_err());
        assert!(Trailer::from_footer(&[0, 0, 0, 0xff]).is_err());
    }
}
