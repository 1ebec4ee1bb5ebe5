use chrono::{DateTime, Utc};
use error_stack::report;

use crate::compress::LaneOutput;
use crate::{Error, FieldPath, RangeSet};

/// Consumer of aligned chunks produced by a [`Chunker`].
///
/// Implementations pack chunks into compressed blocks. `flush_ranges`
/// forces a block boundary so that accumulated range metadata applies to
/// a closed set of chunks.
pub trait BlockWriter: Send {
    fn write_chunk(&mut self, chunk: &[u8], ranges: &RangeSet) -> error_stack::Result<(), Error>;
    fn flush_ranges(&mut self) -> error_stack::Result<(), Error>;
    /// Flush remaining state and surrender the writer's output.
    fn finish(self: Box<Self>) -> error_stack::Result<LaneOutput, Error>;
}

/// Accumulates encoded rows into zero-padded, `align`-byte chunks and
/// forwards them to a [`BlockWriter`], tracking min/max values of the
/// indexed fields and flushing that metadata at most every `range_align`
/// bytes.
pub struct Chunker {
    w: Box<dyn BlockWriter>,
    align: usize,
    range_align: usize,
    buf: Vec<u8>,
    ranges: RangeSet,
    since_flush: usize,
}

impl Chunker {
    pub fn new(w: Box<dyn BlockWriter>, align: usize, range_align: usize) -> Self {
        Self {
            w,
            align,
            range_align: range_align.max(align),
            buf: Vec::with_capacity(align),
            ranges: RangeSet::new(),
            since_flush: 0,
        }
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Append one encoded row, attributing `times` to the chunk that ends
    /// up holding it.
    pub fn write_record(
        &mut self,
        rec: &[u8],
        times: &[(FieldPath, DateTime<Utc>)],
    ) -> error_stack::Result<(), Error> {
        if rec.len() > self.align {
            return Err(report!(Error::TooLarge).attach_printable(format!(
                "{} byte record exceeds {} byte alignment",
                rec.len(),
                self.align
            )));
        }
        if self.buf.len() + rec.len() > self.align {
            self.emit_chunk()?;
        }
        self.buf.extend_from_slice(rec);
        for (path, ts) in times {
            self.ranges.note(path, *ts);
        }
        Ok(())
    }

    /// Pass through a pre-built aligned chunk; only valid on a chunk
    /// boundary. Used when re-chunking a previously written object.
    pub fn copy_chunk(&mut self, chunk: &[u8], ranges: &RangeSet) -> error_stack::Result<(), Error> {
        if !self.buf.is_empty() {
            return Err(report!(Error::Internal)
                .attach_printable("copy_chunk called with partially filled chunk"));
        }
        if chunk.len() != self.align {
            return Err(report!(Error::Internal).attach_printable(format!(
                "copied chunk is {} bytes, alignment is {}",
                chunk.len(),
                self.align
            )));
        }
        self.w.write_chunk(chunk, ranges)?;
        self.since_flush += self.align;
        Ok(())
    }

    /// Force a range flush (and therefore a block boundary) now.
    pub fn force_flush_ranges(&mut self) -> error_stack::Result<(), Error> {
        self.emit_chunk()?;
        self.w.flush_ranges()?;
        self.since_flush = 0;
        Ok(())
    }

    /// Flush the trailing partial chunk.
    pub fn flush(&mut self) -> error_stack::Result<(), Error> {
        self.emit_chunk()
    }

    pub fn into_inner(self) -> Box<dyn BlockWriter> {
        self.w
    }

    fn emit_chunk(&mut self) -> error_stack::Result<(), Error> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.buf.resize(self.align, 0);
        self.w.write_chunk(&self.buf, &self.ranges)?;
        self.buf.clear();
        self.ranges.clear();
        self.since_flush += self.align;
        if self.since_flush >= self.range_align {
            self.w.flush_ranges()?;
            self.since_flush = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Debug)]
    struct Sink {
        chunks: Vec<(Vec<u8>, RangeSet)>,
        flushes: usize,
    }

    struct SinkWriter(Arc<Mutex<Sink>>);

    impl BlockWriter for SinkWriter {
        fn write_chunk(
            &mut self,
            chunk: &[u8],
            ranges: &RangeSet,
        ) -> error_stack::Result<(), Error> {
            self.0
                .lock()
                .unwrap()
                .chunks
                .push((chunk.to_vec(), ranges.clone()));
            Ok(())
        }

        fn flush_ranges(&mut self) -> error_stack::Result<(), Error> {
            self.0.lock().unwrap().flushes += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> error_stack::Result<LaneOutput, Error> {
            Ok(LaneOutput::default())
        }
    }

    #[test]
    fn test_records_are_padded_into_aligned_chunks() {
        let sink = Arc::new(Mutex::new(Sink::default()));
        let mut ch = Chunker::new(Box::new(SinkWriter(sink.clone())), 16, 64);

        ch.write_record(&[1u8; 10], &[]).unwrap();
        ch.write_record(&[2u8; 10], &[]).unwrap();
        ch.flush().unwrap();

        let sink = sink.lock().unwrap();
        assert_eq!(sink.chunks.len(), 2);
        assert_eq!(&sink.chunks[0].0[..10], &[1u8; 10]);
        assert_eq!(&sink.chunks[0].0[10..], &[0u8; 6]);
        assert_eq!(sink.chunks[1].0.len(), 16);
    }

    #[test]
    fn test_oversized_record_is_fatal() {
        let sink = Arc::new(Mutex::new(Sink::default()));
        let mut ch = Chunker::new(Box::new(SinkWriter(sink)), 16, 64);
        let err = ch.write_record(&[0u8; 17], &[]).unwrap_err();
        assert!(crate::is_fatal(&err));
    }

    #[test]
    fn test_ranges_attributed_to_owning_chunk() {
        let sink = Arc::new(Mutex::new(Sink::default()));
        let mut ch = Chunker::new(Box::new(SinkWriter(sink.clone())), 16, 64);
        let path: FieldPath = vec!["ts".to_owned()];
        let t0 = Utc.timestamp_opt(100, 0).unwrap();
        let t1 = Utc.timestamp_opt(900, 0).unwrap();

        ch.write_record(&[1u8; 12], &[(path.clone(), t0)]).unwrap();
        // Overflows into the second chunk; t1 belongs there.
        ch.write_record(&[2u8; 12], &[(path.clone(), t1)]).unwrap();
        ch.flush().unwrap();

        let sink = sink.lock().unwrap();
        let (_, first) = &sink.chunks[0];
        let (_, second) = &sink.chunks[1];
        assert_eq!(first.iter().next().unwrap().1.max, t0);
        assert_eq!(second.iter().next().unwrap().1.min, t1);
    }

    #[test]
    fn test_range_align_forces_flush() {
        let sink = Arc::new(Mutex::new(Sink::default()));
        let mut ch = Chunker::new(Box::new(SinkWriter(sink.clone())), 16, 32);
        for _ in 0..4 {
            ch.write_record(&[3u8; 16], &[]).unwrap();
        }
        ch.flush().unwrap();
        // 4 chunks with a 32-byte range interval = a flush every 2 chunks.
        assert_eq!(sink.lock().unwrap().flushes, 2);
    }
}
