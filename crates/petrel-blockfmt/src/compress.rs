use chrono::Utc;
use error_stack::{report, IntoReport, ResultExt};

use crate::chunker::BlockWriter;
use crate::upload::SharedUploader;
use crate::{BlockDesc, Compression, Error, RangeSet, SparseIndex, Trailer};

/// Part numbers are partitioned per lane so concurrent lanes never race
/// on a part slot; the committed object orders parts numerically, which
/// keeps each lane's bytes contiguous and lane 0 first.
const LANE_PART_STRIDE: i64 = 1 << 20;

/// What one writer lane produced: block descriptors with lane-local
/// offsets, the lane's sparse index, compressed bytes not yet uploaded,
/// and the lane's total compressed size.
#[derive(Debug, Default)]
pub struct LaneOutput {
    pub lane: usize,
    pub blocks: Vec<BlockDesc>,
    pub sparse: SparseIndex,
    pub tail: Vec<u8>,
    pub total: u64,
}

/// Compresses aligned chunks into blocks and uploads them as parts.
///
/// One `CompressionWriter` serves either as the sole writer of an object
/// (single-stream conversion) or as one lane of a [`MultiWriter`].
pub struct CompressionWriter {
    out: SharedUploader,
    comp: Compression,
    input_align: usize,
    target_size: usize,
    min_chunks_per_block: usize,
    lane: usize,
    part_next: i64,
    part_end: i64,
    min_part_size: usize,
    /// Whether `finish` uploads the pending tail (lane mode) or hands it
    /// back for the caller to fold into the object footer (single mode).
    upload_tail: bool,
    pending: Vec<u8>,
    written: u64,
    blocks: Vec<BlockDesc>,
    sparse: SparseIndex,
    cur_start: u64,
    cur_chunks: u32,
    cur_ranges: RangeSet,
}

impl CompressionWriter {
    /// The sole writer of a single-stream conversion.
    pub fn single(
        out: SharedUploader,
        comp: Compression,
        input_align: usize,
        target_size: usize,
        min_chunks_per_block: usize,
    ) -> Self {
        Self::with_lane(out, comp, input_align, target_size, min_chunks_per_block, 0, false)
    }

    fn with_lane(
        out: SharedUploader,
        comp: Compression,
        input_align: usize,
        target_size: usize,
        min_chunks_per_block: usize,
        lane: usize,
        upload_tail: bool,
    ) -> Self {
        let min_part_size = out.lock().unwrap().min_part_size();
        let base = lane as i64 * LANE_PART_STRIDE;
        Self {
            out,
            comp,
            input_align,
            target_size,
            min_chunks_per_block: min_chunks_per_block.max(1),
            lane,
            part_next: base,
            part_end: base + LANE_PART_STRIDE,
            min_part_size,
            upload_tail,
            pending: Vec::new(),
            written: 0,
            blocks: Vec::new(),
            sparse: SparseIndex::default(),
            cur_start: 0,
            cur_chunks: 0,
            cur_ranges: RangeSet::new(),
        }
    }

    fn end_block(&mut self) -> error_stack::Result<(), Error> {
        if self.cur_chunks == 0 {
            return Ok(());
        }
        self.blocks.push(BlockDesc {
            offset: self.cur_start,
            chunks: self.cur_chunks,
        });
        self.sparse.push_block(&self.cur_ranges);
        self.cur_start = self.written;
        self.cur_chunks = 0;
        self.cur_ranges.clear();
        self.maybe_upload()
    }

    fn maybe_upload(&mut self) -> error_stack::Result<(), Error> {
        if self.pending.len() < self.min_part_size {
            return Ok(());
        }
        let part = self.take_part()?;
        self.out
            .lock()
            .unwrap()
            .upload(part, &self.pending)
            .into_report()
            .change_context(Error::Upload)?;
        self.pending.clear();
        Ok(())
    }

    fn take_part(&mut self) -> error_stack::Result<i64, Error> {
        if self.part_next >= self.part_end {
            return Err(report!(Error::TooManyParts));
        }
        let part = self.part_next;
        self.part_next += 1;
        Ok(part)
    }
}

impl BlockWriter for CompressionWriter {
    fn write_chunk(&mut self, chunk: &[u8], ranges: &RangeSet) -> error_stack::Result<(), Error> {
        if chunk.len() != self.input_align {
            return Err(report!(Error::Internal).attach_printable(format!(
                "chunk is {} bytes, input alignment is {}",
                chunk.len(),
                self.input_align
            )));
        }
        let before = self.pending.len();
        self.comp
            .compress(chunk, &mut self.pending)
            .into_report()
            .change_context(Error::Write)?;
        self.written += (self.pending.len() - before) as u64;
        self.cur_chunks += 1;
        self.cur_ranges.union(ranges);
        let block_size = self.written - self.cur_start;
        if block_size >= self.target_size as u64
            && self.cur_chunks as usize >= self.min_chunks_per_block
        {
            self.end_block()?;
        }
        Ok(())
    }

    fn flush_ranges(&mut self) -> error_stack::Result<(), Error> {
        self.end_block()
    }

    fn finish(mut self: Box<Self>) -> error_stack::Result<LaneOutput, Error> {
        self.end_block()?;
        let tail = if self.upload_tail && !self.pending.is_empty() {
            let part = self.take_part()?;
            self.out
                .lock()
                .unwrap()
                .upload(part, &self.pending)
                .into_report()
                .change_context(Error::Upload)?;
            Vec::new()
        } else {
            std::mem::take(&mut self.pending)
        };
        Ok(LaneOutput {
            lane: self.lane,
            blocks: std::mem::take(&mut self.blocks),
            sparse: std::mem::take(&mut self.sparse),
            tail,
            total: self.written,
        })
    }
}

/// Coordinates several concurrent [`CompressionWriter`] lanes writing one
/// object through a shared uploader.
///
/// Lanes are opened up front, run independently, and their outputs are
/// stitched into a single trailer at [`MultiWriter::close`]; nothing is
/// committed unless every lane finished.
pub struct MultiWriter {
    out: SharedUploader,
    comp: Compression,
    input_align: usize,
    target_size: usize,
    min_chunks_per_block: usize,
    lanes: usize,
}

impl MultiWriter {
    pub fn new(
        out: SharedUploader,
        comp: Compression,
        input_align: usize,
        target_size: usize,
        min_chunks_per_block: usize,
    ) -> Self {
        Self {
            out,
            comp,
            input_align,
            target_size,
            min_chunks_per_block,
            lanes: 0,
        }
    }

    /// Open the next writer lane.
    pub fn open(&mut self) -> CompressionWriter {
        let lane = self.lanes;
        self.lanes += 1;
        CompressionWriter::with_lane(
            self.out.clone(),
            self.comp,
            self.input_align,
            self.target_size,
            self.min_chunks_per_block,
            lane,
            true,
        )
    }

    /// Merge the lane outputs, publish the trailer, and commit the
    /// object. `outputs` must hold every opened lane's output.
    pub fn close(self, mut outputs: Vec<LaneOutput>) -> error_stack::Result<Trailer, Error> {
        if outputs.len() != self.lanes {
            return Err(report!(Error::Internal).attach_printable(format!(
                "{} lane outputs for {} opened lanes",
                outputs.len(),
                self.lanes
            )));
        }
        outputs.sort_by_key(|o| o.lane);
        let mut blocks = Vec::new();
        let mut sparse = SparseIndex::default();
        let mut base = 0u64;
        for out in &outputs {
            debug_assert!(out.tail.is_empty(), "lane tail must be uploaded at finish");
            blocks.extend(out.blocks.iter().map(|b| BlockDesc {
                offset: base + b.offset,
                chunks: b.chunks,
            }));
            sparse.append(&out.sparse);
            base += out.total;
        }
        let trailer = Trailer {
            version: 1,
            algo: self.comp.name().to_owned(),
            align: self.input_align as u32,
            offset: base,
            blocks,
            sparse,
            created: Utc::now(),
        };
        let mut footer = Vec::new();
        trailer.append_footer(&mut footer);
        self.out
            .lock()
            .unwrap()
            .close(&footer)
            .into_report()
            .change_context(Error::Upload)?;
        Ok(trailer)
    }
}
