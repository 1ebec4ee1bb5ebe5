use std::io::{self, Read, Write};

/// Block compression algorithms the format understands.
///
/// Every chunk is compressed as its own self-delimiting frame, so a block
/// is decompressed by reading frames until the expected byte count is
/// reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd,
    Gzip,
}

impl Compression {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "zstd" => Some(Compression::Zstd),
            "gzip" => Some(Compression::Gzip),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::Zstd => "zstd",
            Compression::Gzip => "gzip",
        }
    }

    /// Compress `src` as one frame appended to `dst`.
    pub fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Compression::Zstd => zstd::stream::copy_encode(src, dst, 0),
            Compression::Gzip => {
                let mut enc =
                    flate2::write::GzEncoder::new(dst, flate2::Compression::default());
                enc.write_all(src)?;
                enc.finish()?;
                Ok(())
            }
        }
    }

    /// Decompress a sequence of frames, expecting exactly `expected`
    /// output bytes.
    pub fn decompress(&self, src: &[u8], expected: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected);
        match self {
            Compression::Zstd => {
                let mut dec = zstd::stream::read::Decoder::new(src)?;
                dec.read_to_end(&mut out)?;
            }
            Compression::Gzip => {
                let mut dec = flate2::read::MultiGzDecoder::new(src);
                dec.read_to_end(&mut out)?;
            }
        }
        if out.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {expected} decompressed bytes, got {}", out.len()),
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_multiple_frames() {
        for comp in [Compression::Zstd, Compression::Gzip] {
            let a = vec![7u8; 4096];
            let b = vec![9u8; 4096];
            let mut frames = Vec::new();
            comp.compress(&a, &mut frames).unwrap();
            comp.compress(&b, &mut frames).unwrap();

            let out = comp.decompress(&frames, 8192).unwrap();
            assert_eq!(&out[..4096], &a[..]);
            assert_eq!(&out[4096..], &b[..]);
        }
    }

    #[test]
    fn test_unknown_name() {
        assert_eq!(Compression::from_name("lzma"), None);
        assert_eq!(Compression::from_name("zstd"), Some(Compression::Zstd));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut frames = Vec::new();
        Compression::Zstd.compress(&[1, 2, 3], &mut frames).unwrap();
        assert!(Compression::Zstd.decompress(&frames, 999).is_err());
    }
}
