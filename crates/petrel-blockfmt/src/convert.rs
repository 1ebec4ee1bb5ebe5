use std::io::Read;
use std::sync::Arc;

use chrono::Utc;
use error_stack::{report, IntoReport, ResultExt};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, Instrument};

use crate::chunker::BlockWriter;
use crate::compress::{CompressionWriter, LaneOutput, MultiWriter};
use crate::decoder::Decoder;
use crate::json::{convert_json, ErrorTap, Hints};
use crate::upload::SharedUploader;
use crate::{Chunker, Compression, Error, Trailer};

/// Bytes we try to keep in flight across all prefetched inputs,
/// regardless of the level of parallelism used to ingest them.
pub(crate) const WANT_INFLIGHT: u64 = 80 * 1024 * 1024;

/// Never prefetch more than this many inputs ahead of conversion.
pub(crate) const MAX_LOOKAHEAD: usize = 64;

/// The strategy that turns one input stream into aligned output chunks.
pub trait RowFormat: Send {
    fn convert(
        &self,
        src: Box<dyn Read + Send>,
        dst: &mut Chunker,
    ) -> error_stack::Result<(), Error>;

    /// Format name recorded in object descriptions.
    fn name(&self) -> &str;

    /// Accept (or reject) schema guidance.
    fn use_hints(&mut self, hints: Option<&[u8]>) -> error_stack::Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decomp {
    None,
    Gzip,
    Zstd,
}

impl Decomp {
    fn name(&self) -> Option<&'static str> {
        match self {
            Decomp::None => None,
            Decomp::Gzip => Some("gzip"),
            Decomp::Zstd => Some("zstd"),
        }
    }
}

struct JsonFormat {
    decomp: Decomp,
    name: &'static str,
    hints: Option<Hints>,
    cloudtrail: bool,
}

impl RowFormat for JsonFormat {
    fn convert(
        &self,
        src: Box<dyn Read + Send>,
        dst: &mut Chunker,
    ) -> error_stack::Result<(), Error> {
        let (tap, seen) = ErrorTap::new(src);
        match self.decomp {
            Decomp::None => {
                convert_json(tap, dst, self.hints.as_ref(), self.cloudtrail, None, None)
            }
            Decomp::Gzip => {
                let dec = flate2::read::GzDecoder::new(tap);
                convert_json(
                    dec,
                    dst,
                    self.hints.as_ref(),
                    self.cloudtrail,
                    Some(&seen),
                    Decomp::Gzip.name(),
                )
            }
            Decomp::Zstd => {
                let dec = zstd::stream::read::Decoder::new(tap)
                    .map_err(|e| report!(Error::Corrupt("zstd")).attach_printable(e.to_string()))?;
                convert_json(
                    dec,
                    dst,
                    self.hints.as_ref(),
                    self.cloudtrail,
                    Some(&seen),
                    Decomp::Zstd.name(),
                )
            }
        }
    }

    fn name(&self) -> &str {
        self.name
    }

    fn use_hints(&mut self, hints: Option<&[u8]>) -> error_stack::Result<(), Error> {
        if self.cloudtrail && hints.is_some() {
            return Err(report!(Error::HintsRejected));
        }
        self.hints = match hints {
            None => None,
            Some(bytes) => Some(Hints::parse(bytes)?),
        };
        Ok(())
    }
}

/// Pass-through for data already encoded as wire rows: values are
/// validated and re-aligned, nothing else.
struct RawRows;

impl RowFormat for RawRows {
    fn convert(
        &self,
        mut src: Box<dyn Read + Send>,
        dst: &mut Chunker,
    ) -> error_stack::Result<(), Error> {
        let mut data = Vec::new();
        src.read_to_end(&mut data)
            .into_report()
            .change_context(Error::Read)?;
        let mut body = petrel_wire::skip_padding(&data);
        while !body.is_empty() {
            let size = petrel_wire::size_of(body)
                .change_context(Error::NoMatch)
                .attach_printable("undecodable raw row")?;
            dst.write_record(&body[..size], &[])?;
            body = petrel_wire::skip_padding(&body[size..]);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "rows"
    }

    fn use_hints(&mut self, _hints: Option<&[u8]>) -> error_stack::Result<(), Error> {
        Ok(())
    }
}

/// Look up the row format for a recognised file suffix.
///
/// Callers are expected to reject unrecognised suffixes before ever
/// constructing an [`Input`].
pub fn suffix_format(suffix: &str) -> Option<Box<dyn RowFormat + Send>> {
    match suffix {
        ".json" => Some(Box::new(JsonFormat {
            decomp: Decomp::None,
            name: "json",
            hints: None,
            cloudtrail: false,
        })),
        ".json.gz" => Some(Box::new(JsonFormat {
            decomp: Decomp::Gzip,
            name: "json.gz",
            hints: None,
            cloudtrail: false,
        })),
        ".json.zst" => Some(Box::new(JsonFormat {
            decomp: Decomp::Zstd,
            name: "json.zst",
            hints: None,
            cloudtrail: false,
        })),
        _ => None,
    }
}

/// The row format for AWS CloudTrail logs with the given compression
/// suffix: `""`, `".gz"`, or `".zst"`.
pub fn cloudtrail_json(compression: &str) -> error_stack::Result<Box<dyn RowFormat + Send>, Error> {
    let (decomp, name) = match compression {
        "" => (Decomp::None, "json"),
        ".gz" => (Decomp::Gzip, "json.gz"),
        ".zst" => (Decomp::Zstd, "json.zst"),
        other => {
            return Err(report!(Error::UnknownCompression(other.to_owned())));
        }
    };
    Ok(Box::new(JsonFormat {
        decomp,
        name,
        hints: None,
        cloudtrail: true,
    }))
}

pub fn raw_rows() -> Box<dyn RowFormat + Send> {
    Box::new(RawRows)
}

/// One input stream plus the strategy that converts it.
///
/// The converter owns the reader from the moment [`Converter::run`]
/// starts until the stream has been consumed or deliberately dropped;
/// each reader is closed exactly once on every path through a run.
pub struct Input {
    pub path: String,
    pub etag: String,
    pub size: u64,
    pub(crate) reader: Option<Box<dyn Read + Send>>,
    pub(crate) format: Option<Box<dyn RowFormat + Send>>,
    /// Populated by [`Converter::run`] when this input failed.
    pub err: Option<Error>,
}

impl Input {
    pub fn new(
        path: impl Into<String>,
        etag: impl Into<String>,
        size: u64,
        reader: Box<dyn Read + Send>,
        format: Box<dyn RowFormat + Send>,
    ) -> Self {
        Self {
            path: path.into(),
            etag: etag.into(),
            size,
            reader: Some(reader),
            format: Some(format),
            err: None,
        }
    }

    fn close_reader(&mut self) {
        self.reader = None;
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("path", &self.path)
            .field("etag", &self.etag)
            .field("size", &self.size)
            .field("err", &self.err)
            .finish()
    }
}

/// A previously written object to concatenate ahead of the new inputs.
pub struct Prepend {
    pub reader: Box<dyn Read + Send>,
    pub trailer: Trailer,
}

/// An input travelling through the dispatch machinery with its original
/// position, so error slots land back in [`Converter::inputs`].
pub(crate) struct Queued {
    pub(crate) index: usize,
    pub(crate) input: Input,
}

/// Converts a batch of heterogeneous input streams into one aligned,
/// compressed, sparse-indexed object, committing its trailer only if
/// every stream converted.
pub struct Converter {
    pub prepend: Option<Prepend>,
    pub inputs: Vec<Input>,
    pub output: SharedUploader,
    /// Name of the block compression to use ("zstd" or "gzip").
    pub comp: String,
    /// Pre-compression chunk alignment; must be a power of two.
    pub align: usize,
    /// Maximum bytes between sparse-index range flushes.
    pub flush_meta: usize,
    /// Post-compression block size target.
    pub target_size: usize,
    /// Number of writer lanes; 0 means one per CPU.
    pub parallel: usize,
    pub disable_prefetch: bool,
    trailer: Option<Trailer>,
}

impl Converter {
    pub fn new(output: SharedUploader) -> Self {
        Self {
            prepend: None,
            inputs: Vec::new(),
            output,
            comp: "zstd".to_owned(),
            align: 1 << 20,
            flush_meta: 16 << 20,
            target_size: 8 << 20,
            parallel: 0,
            disable_prefetch: false,
            trailer: None,
        }
    }

    /// Whether this configuration converts with several writer lanes.
    pub fn multi_stream(&self) -> bool {
        self.inputs.len() > 1 && (self.parallel == 0 || self.parallel > 1)
    }

    /// The trailer of the committed object; `None` until a run succeeds.
    pub fn trailer(&self) -> Option<&Trailer> {
        self.trailer.as_ref()
    }

    fn min_chunks_per_block(&self) -> usize {
        // Blocks should hold at least half a flush interval so range
        // flushes do not degenerate into one block per chunk.
        (self.flush_meta / (self.align * 2)).max(1)
    }

    fn lanes(&self) -> usize {
        if self.parallel == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.parallel
        }
    }

    /// Run the conversion, returning the first error encountered.
    ///
    /// Inputs that failed have their [`Input::err`] slot populated. A
    /// run stops at the first error, so later inputs may not have been
    /// processed at all; their readers are still closed.
    pub async fn run(&mut self) -> error_stack::Result<(), Error> {
        if self.inputs.is_empty() {
            return Err(report!(Error::NoInputs));
        }
        if !self.align.is_power_of_two() {
            return Err(report!(Error::BadAlign(self.align)));
        }
        let comp = Compression::from_name(&self.comp)
            .ok_or_else(|| report!(Error::UnknownCompression(self.comp.clone())))?;
        let multi = self.multi_stream();
        let span = info_span!("convert", inputs = self.inputs.len(), multi);
        if multi {
            self.run_multi(comp).instrument(span).await
        } else {
            self.run_single(comp).instrument(span).await
        }
    }

    async fn run_single(&mut self, comp: Compression) -> error_stack::Result<(), Error> {
        let writer = CompressionWriter::single(
            self.output.clone(),
            comp,
            self.align,
            self.target_size,
            self.min_chunks_per_block(),
        );
        let mut chunker = Chunker::new(Box::new(writer), self.align, self.flush_meta);

        if let Some(pre) = self.prepend.take() {
            let res = tokio::task::spawn_blocking(move || {
                let mut chunker = chunker;
                let res = run_prepend(pre, &mut chunker);
                (chunker, res)
            })
            .await
            .map_err(|_| report!(Error::Internal))?;
            chunker = res.0;
            if let Err(e) = res.1 {
                self.close_remaining(0);
                return Err(e.change_context(Error::Prepend));
            }
        }

        let n = self.inputs.len();
        let mut ready: Vec<Option<tokio::task::JoinHandle<Box<dyn Read + Send>>>> =
            (0..n).map(|_| None).collect();
        let mut next = 0usize;
        let mut inflight = 0u64;

        for i in 0..n {
            // If this input was queued for prefetch, wait for the wake
            // read to finish and take the reader back.
            if let Some(handle) = ready[i].take() {
                match handle.await {
                    Ok(reader) => self.inputs[i].reader = Some(reader),
                    Err(_) => {
                        self.close_remaining(i);
                        return Err(report!(Error::Internal));
                    }
                }
                inflight = inflight.saturating_sub(self.inputs[i].size);
            }
            if next <= i {
                next = i + 1;
            }
            // Start readahead on inputs we will need soon.
            while !self.disable_prefetch
                && inflight < WANT_INFLIGHT
                && (next - i) < MAX_LOOKAHEAD
                && next < n
            {
                if let Some(reader) = self.inputs[next].reader.take() {
                    ready[next] = Some(tokio::task::spawn_blocking(move || wake(reader)));
                    inflight += self.inputs[next].size;
                }
                next += 1;
            }

            let reader = self
                .inputs[i]
                .reader
                .take()
                .ok_or_else(|| report!(Error::Internal))?;
            let format = self
                .inputs[i]
                .format
                .take()
                .ok_or_else(|| report!(Error::Internal))?;
            debug!(path = %self.inputs[i].path, "converting input");
            let (returned, res) = tokio::task::spawn_blocking(move || {
                let mut chunker = chunker;
                let res = format.convert(reader, &mut chunker);
                (chunker, res)
            })
            .await
            .map_err(|_| report!(Error::Internal))?;
            chunker = returned;

            if let Err(e) = res {
                // Wait for outstanding wake reads, then close every
                // remaining reader.
                for handle in ready.iter_mut().skip(i + 1).filter_map(Option::take) {
                    let _ = handle.await;
                }
                self.close_remaining(i + 1);
                self.inputs[i].err = Some(e.current_context().clone());
                return Err(e.attach_printable(format!("input {}", self.inputs[i].path)));
            }
        }

        let close_res = tokio::task::spawn_blocking(move || -> error_stack::Result<_, Error> {
            let mut chunker = chunker;
            chunker.flush()?;
            chunker.into_inner().finish()
        })
        .await
        .map_err(|_| report!(Error::Internal))?;
        let lane = close_res?;
        self.commit_single(comp, lane)
    }

    fn commit_single(
        &mut self,
        comp: Compression,
        lane: LaneOutput,
    ) -> error_stack::Result<(), Error> {
        let trailer = Trailer {
            version: 1,
            algo: comp.name().to_owned(),
            align: self.align as u32,
            offset: lane.total,
            blocks: lane.blocks,
            sparse: lane.sparse,
            created: Utc::now(),
        };
        let mut footer = lane.tail;
        trailer.append_footer(&mut footer);
        self.output
            .lock()
            .unwrap()
            .close(&footer)
            .into_report()
            .change_context(Error::Upload)?;
        info!(blocks = trailer.blocks.len(), "object committed");
        self.trailer = Some(trailer);
        Ok(())
    }

    fn close_remaining(&mut self, from: usize) {
        for input in &mut self.inputs[from..] {
            input.close_reader();
        }
    }

    async fn run_multi(&mut self, comp: Compression) -> error_stack::Result<(), Error> {
        let mut mw = MultiWriter::new(
            self.output.clone(),
            comp,
            self.align,
            self.target_size,
            self.min_chunks_per_block(),
        );
        let n = self.inputs.len();
        let mut p = self.lanes();
        let use_prefetch = if p >= n {
            p = n;
            false
        } else {
            !self.disable_prefetch
        };

        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Queued>(p);
        let dispatch_rx = Arc::new(tokio::sync::Mutex::new(dispatch_rx));
        let (done_tx, mut done_rx) = mpsc::channel::<Queued>(n);

        let mut lanes = Vec::with_capacity(p);
        for lane_idx in 0..p {
            let writer = mw.open();
            let chunker = Chunker::new(Box::new(writer), self.align, self.flush_meta);
            let prepend = if lane_idx == 0 { self.prepend.take() } else { None };
            let rx = dispatch_rx.clone();
            let done = done_tx.clone();
            let span = info_span!("lane", lane = lane_idx);
            lanes.push(tokio::spawn(
                lane_run(chunker, prepend, rx, done).instrument(span),
            ));
        }
        drop(done_tx);
        drop(dispatch_rx);

        let feed_tx = if use_prefetch {
            crate::prefetch::spawn(
                dispatch_tx.clone(),
                MAX_LOOKAHEAD.min(n),
                WANT_INFLIGHT,
            )
        } else {
            dispatch_tx.clone()
        };
        drop(dispatch_tx);

        // Remember identity for any slot a crashed lane fails to return.
        let meta: Vec<(String, String, u64)> = self
            .inputs
            .iter()
            .map(|i| (i.path.clone(), i.etag.clone(), i.size))
            .collect();
        let inputs = std::mem::take(&mut self.inputs);
        let mut undelivered = Vec::new();
        for (index, input) in inputs.into_iter().enumerate() {
            if let Err(mpsc::error::SendError(mut q)) = feed_tx.send(Queued { index, input }).await
            {
                // Every lane is gone; nothing will drain the channel.
                q.input.close_reader();
                undelivered.push(q);
            }
        }
        drop(feed_tx);

        let mut first: Option<error_stack::Report<Error>> = None;
        let mut extra = 0usize;
        let mut outputs = Vec::with_capacity(p);
        for lane in futures::future::join_all(lanes).await {
            match lane {
                Ok(Ok(out)) => outputs.push(out),
                Ok(Err(e)) => {
                    if first.is_none() {
                        first = Some(e);
                    } else {
                        extra += 1;
                    }
                }
                Err(_) => {
                    if first.is_none() {
                        first = Some(report!(Error::Internal).attach_printable("lane panicked"));
                    } else {
                        extra += 1;
                    }
                }
            }
        }

        // Reassemble the input list, preserving order and error slots.
        let mut slots: Vec<Option<Input>> = (0..n).map(|_| None).collect();
        for q in undelivered {
            slots[q.index] = Some(q.input);
        }
        while let Some(q) = done_rx.recv().await {
            slots[q.index] = Some(q.input);
        }
        self.inputs = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    let (path, etag, size) = meta[i].clone();
                    Input {
                        path,
                        etag,
                        size,
                        reader: None,
                        format: None,
                        err: Some(Error::Internal),
                    }
                })
            })
            .collect();

        if let Some(e) = first {
            if extra > 0 {
                return Err(e.attach_printable(format!("(and {extra} other errors)")));
            }
            return Err(e);
        }

        // Don't finalize unless everything up to this point succeeded.
        let trailer = mw.close(outputs)?;
        info!(blocks = trailer.blocks.len(), "object committed");
        self.trailer = Some(trailer);
        Ok(())
    }
}

fn wake(mut reader: Box<dyn Read + Send>) -> Box<dyn Read + Send> {
    // A zero-byte read wakes lazy handles (HTTP bodies, cold files)
    // without consuming stream data.
    let _ = reader.read(&mut []);
    reader
}

fn run_prepend(pre: Prepend, chunker: &mut Chunker) -> error_stack::Result<u64, Error> {
    let mut reader = pre.reader;
    let copied = Decoder::new(&pre.trailer).copy(chunker, &mut reader)?;
    // reader dropped here: the prepend stream is closed on both paths
    Ok(copied)
}

async fn lane_run(
    mut chunker: Chunker,
    prepend: Option<Prepend>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Queued>>>,
    done: mpsc::Sender<Queued>,
) -> error_stack::Result<LaneOutput, Error> {
    if let Some(pre) = prepend {
        let (returned, res) = tokio::task::spawn_blocking(move || {
            let mut chunker = chunker;
            let res = run_prepend(pre, &mut chunker);
            (chunker, res)
        })
        .await
        .map_err(|_| report!(Error::Internal))?;
        chunker = returned;
        if let Err(e) = res {
            drain(&rx, &done).await;
            return Err(e.change_context(Error::Prepend));
        }
    }

    loop {
        let queued = { rx.lock().await.recv().await };
        let Some(mut queued) = queued else { break };
        let reader = queued.input.reader.take();
        let format = queued.input.format.take();
        let (Some(reader), Some(format)) = (reader, format) else {
            drain(&rx, &done).await;
            let _ = done.send(queued).await;
            return Err(report!(Error::Internal).attach_printable("input dispatched twice"));
        };
        debug!(path = %queued.input.path, "converting input");
        let (returned, mut queued, res) = tokio::task::spawn_blocking(move || {
            let mut chunker = chunker;
            let res = format.convert(reader, &mut chunker);
            (chunker, queued, res)
        })
        .await
        .map_err(|_| report!(Error::Internal))?;
        chunker = returned;
        if let Err(e) = res {
            queued.input.err = Some(e.current_context().clone());
            let path = queued.input.path.clone();
            let _ = done.send(queued).await;
            drain(&rx, &done).await;
            return Err(e.attach_printable(format!("input {path}")));
        }
        let _ = done.send(queued).await;
    }

    tokio::task::spawn_blocking(move || -> error_stack::Result<LaneOutput, Error> {
        chunker.flush()?;
        chunker.into_inner().finish()
    })
    .await
    .map_err(|_| report!(Error::Internal))?
}

/// Consume everything left in the dispatch queue, closing each reader so
/// no stream leaks when a lane aborts.
async fn drain(rx: &Arc<tokio::sync::Mutex<mpsc::Receiver<Queued>>>, done: &mpsc::Sender<Queued>) {
    loop {
        let queued = { rx.lock().await.recv().await };
        match queued {
            Some(mut q) => {
                q.input.close_reader();
                let _ = done.send(q).await;
            }
            None => break,
        }
    }
}
