use std::hash::Hasher;
use std::net::SocketAddr;
use std::sync::Arc;

use error_stack::{report, ResultExt};
use petrel_db::{Blob, CompressedPart};
use petrel_wire::{Buffer, Symtab, Type};
use siphasher::sip::SipHasher24;
use tracing::debug;
use uuid::Uuid;

use crate::filter::{compile, CompiledFilter, Decision};
use crate::handle::{FilterHandle, TableHandle};
use crate::transport::Transport;
use crate::{Error, Expr};

/// Default granularity of compressed-part splitting.
pub const DEFAULT_SPLIT_SIZE: u64 = 100 * 1024 * 1024;

// Fixed SipHash keys: every worker must derive the same peer for the
// same etag without coordinating.
const PARTITION_KEY0: u64 = 0x5d1ec810;
const PARTITION_KEY1: u64 = 0xfebed702;

/// Shards a table handle's blobs across peer workers.
///
/// Assignment is a pure function of each blob's etag and the peer list
/// length, so workers holding the same peer list agree on ownership
/// without a coordination channel.
pub struct Splitter {
    /// Byte threshold for compressed-part granularity; 0 means
    /// [`DEFAULT_SPLIT_SIZE`].
    pub split_size: u64,
    worker: Uuid,
    peers: Vec<SocketAddr>,
    self_addr: Option<SocketAddr>,
    /// Total decompressed input represented by the split.
    total: u64,
    /// Upper bound on bytes actually scanned after sparse pruning.
    max_scan: u64,
}

impl Splitter {
    pub fn new(worker: Uuid, peers: Vec<SocketAddr>, self_addr: Option<SocketAddr>) -> Self {
        Self {
            split_size: 0,
            worker,
            peers,
            self_addr,
            total: 0,
            max_scan: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn max_scan(&self) -> u64 {
        self.max_scan
    }

    /// Shard `handle`'s blobs into per-peer sub-tables.
    ///
    /// The handle must be the filter-carrying variant produced by
    /// [`Env::stat`](crate::Env::stat).
    pub fn split(
        &mut self,
        table: &Expr,
        handle: &dyn TableHandle,
    ) -> error_stack::Result<Subtables, Error> {
        let fh = handle
            .as_any()
            .downcast_ref::<FilterHandle>()
            .ok_or_else(|| report!(Error::HandleType))?;
        if self.peers.is_empty() {
            return Err(report!(Error::NoPeers));
        }
        let size = if self.split_size == 0 {
            DEFAULT_SPLIT_SIZE
        } else {
            self.split_size
        };
        let flt = fh
            .compiled
            .clone()
            .or_else(|| fh.filter.as_ref().and_then(compile));

        let mut splits: Vec<Split> = (0..self.peers.len())
            .map(|i| Split {
                transport: self.transport(i),
                blobs: Vec::new(),
            })
            .collect();
        let mut blobs: Vec<Blob> = Vec::new();
        let mut insert = |splits: &mut Vec<Split>, this: &Self, blob: Blob| {
            let peer = this.partition(&blob.stat().etag);
            splits[peer].blobs.push(blobs.len());
            blobs.push(blob);
        };

        for blob in &fh.blobs {
            match blob {
                Blob::Compressed(c) => {
                    self.total += c.trailer.decompressed();
                    for part in CompressedPart::split(c, size) {
                        // only ship parts that survive pushdown
                        let scan = max_scan(&part, flt.as_ref());
                        if scan == 0 {
                            continue;
                        }
                        self.max_scan += scan;
                        insert(&mut splits, self, Blob::Part(part));
                    }
                }
                other => {
                    // nothing to prune or slice without a trailer
                    let stat = other.stat();
                    self.total += stat.size;
                    self.max_scan += stat.size;
                    insert(&mut splits, self, other.clone());
                }
            }
        }

        splits.retain(|s| !s.blobs.is_empty());
        debug!(
            peers = splits.len(),
            blobs = blobs.len(),
            total = self.total,
            max_scan = self.max_scan,
            "table split"
        );
        Ok(Subtables {
            splits,
            table: table.clone(),
            blobs,
            filter: None, // pushed down later
            next: None,
            ctor: default_handle_fn(),
        })
    }

    /// The peer index owning `etag`.
    fn partition(&self, etag: &str) -> usize {
        let mut hasher = SipHasher24::new_with_keys(PARTITION_KEY0, PARTITION_KEY1);
        hasher.write(etag.as_bytes());
        let hash = hasher.finish();
        let idx = (hash / (u64::MAX / self.peers.len() as u64)) as usize;
        idx.min(self.peers.len() - 1)
    }

    fn transport(&self, i: usize) -> Transport {
        if Some(self.peers[i]) == self.self_addr {
            Transport::Local
        } else {
            Transport::Remote {
                worker: self.worker,
                addr: self.peers[i],
            }
        }
    }
}

/// Maximum bytes a peer scans for `part`, with the pushdown filter
/// applied; 0 means the filter excludes the entire part.
fn max_scan(part: &CompressedPart, flt: Option<&CompiledFilter>) -> u64 {
    let trailer = &part.parent.trailer;
    let shift = trailer.block_shift();
    let mut scan = 0u64;
    for (i, block) in trailer.blocks[part.start_block..part.end_block]
        .iter()
        .enumerate()
    {
        let keep = match flt {
            None => true,
            Some(f) => f.matches(&trailer.sparse, part.start_block + i) != Decision::Never,
        };
        if keep {
            scan += (block.chunks as u64) << shift;
        }
    }
    scan
}

/// One peer's share of a split: its transport and indexes into the
/// shared blob pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub transport: Transport,
    pub blobs: Vec<usize>,
}

impl Split {
    /// Encoded as `[transport, [blobIndex…]]`.
    fn encode(&self, st: &mut Symtab, buf: &mut Buffer) {
        buf.begin_list();
        self.transport.encode(st, buf);
        buf.begin_list();
        for &i in &self.blobs {
            buf.write_int(i as i64);
        }
        buf.end_list();
        buf.end_list();
    }

    fn decode(st: &Symtab, body: &[u8]) -> error_stack::Result<Self, Error> {
        if petrel_wire::type_of(body).change_context(Error::BadPlan)? != Type::List {
            return Err(report!(Error::BadPlan).attach_printable("split must be a list"));
        }
        let inner = petrel_wire::contents(body).change_context(Error::BadPlan)?;
        let (transport, rest) = Transport::decode(st, inner)?;
        let mut blobs = Vec::new();
        let rest = petrel_wire::unpack_list(rest, |item| {
            let (v, _) = petrel_wire::read_int(item)?;
            blobs.push(v as usize);
            Ok(())
        })
        .change_context(Error::BadPlan)?;
        petrel_wire::expect_consumed(rest).change_context(Error::BadPlan)?;
        Ok(Split { transport, blobs })
    }
}

/// Builds the table handle a peer receives: a subset of the blob pool
/// plus the (late-bound) filter. Decoding takes this from the caller so
/// the decoder need not know how handles are built.
pub type HandleFn = Arc<dyn Fn(Vec<Blob>, Option<Expr>) -> Box<dyn TableHandle> + Send + Sync>;

pub fn default_handle_fn() -> HandleFn {
    Arc::new(|blobs, filter| Box::new(FilterHandle::new(blobs, filter)))
}

/// One per-peer work unit materialised out of a [`Subtables`] chain.
pub struct Subtable {
    pub transport: Transport,
    pub table: Expr,
    pub handle: Box<dyn TableHandle>,
}

/// A chain of per-peer work: `(splits, table, blob-pool, filter, next)`.
///
/// The chain form lets a later planning stage append more work without
/// copying blob pools; handles are materialised lazily per sub-table.
pub struct Subtables {
    pub splits: Vec<Split>,
    pub table: Expr,
    pub blobs: Vec<Blob>,
    pub filter: Option<Expr>,
    pub next: Option<Box<Subtables>>,
    ctor: HandleFn,
}

impl Subtables {
    pub fn len(&self) -> usize {
        self.splits.len() + self.next.as_ref().map_or(0, |n| n.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialise sub-table `i` of the chain.
    pub fn subtable(&self, i: usize) -> Option<Subtable> {
        if i >= self.splits.len() {
            return self.next.as_ref()?.subtable(i - self.splits.len());
        }
        let split = &self.splits[i];
        let blobs = split
            .blobs
            .iter()
            .map(|&bi| self.blobs[bi].clone())
            .collect();
        Some(Subtable {
            transport: split.transport.clone(),
            table: self.table.clone(),
            handle: (self.ctor)(blobs, self.filter.clone()),
        })
    }

    /// Set the pushdown filter on every link of the chain. Pushdown
    /// arrives after splitting.
    pub fn set_filter(&mut self, e: &Expr) {
        self.filter = Some(e.clone());
        if let Some(next) = &mut self.next {
            next.set_filter(e);
        }
    }

    /// Thread `other` onto the tail of the chain.
    pub fn append(mut self, other: Subtables) -> Subtables {
        self.next = Some(Box::new(match self.next.take() {
            None => other,
            Some(next) => (*next).append(other),
        }));
        self
    }

    /// Encoded as `[[split…], table, blobs, filterOrNull, nextOrNull]`.
    pub fn encode(&self, st: &mut Symtab, buf: &mut Buffer) -> error_stack::Result<(), Error> {
        buf.begin_list();
        buf.begin_list();
        for split in &self.splits {
            split.encode(st, buf);
        }
        buf.end_list();
        self.table.encode(st, buf);
        Blob::encode_list(&self.blobs, st, buf);
        match &self.filter {
            None => buf.write_null(),
            Some(f) => f.encode(st, buf),
        }
        match &self.next {
            None => buf.write_null(),
            Some(next) => next.encode(st, buf)?,
        }
        buf.end_list();
        Ok(())
    }

    /// Decode a chain written by [`Subtables::encode`], rebuilding
    /// handles through `ctor`. Returns the remaining input.
    pub fn decode<'a>(
        st: &Symtab,
        body: &'a [u8],
        ctor: HandleFn,
    ) -> error_stack::Result<(Self, &'a [u8]), Error> {
        if petrel_wire::type_of(body).change_context(Error::BadPlan)? != Type::List {
            return Err(report!(Error::BadPlan).attach_printable("subtables must be a list"));
        }
        let total = petrel_wire::size_of(body).change_context(Error::BadPlan)?;
        let inner = petrel_wire::contents(body).change_context(Error::BadPlan)?;

        let mut splits = Vec::new();
        let mut split_err = None;
        let rest = petrel_wire::unpack_list(inner, |item| {
            match Split::decode(st, item) {
                Ok(s) => splits.push(s),
                Err(e) => {
                    if split_err.is_none() {
                        split_err = Some(e);
                    }
                }
            }
            Ok(())
        })
        .change_context(Error::BadPlan)?;
        if let Some(e) = split_err {
            return Err(e);
        }

        let (table, rest) = Expr::decode(st, rest)?;
        let (blobs, rest) = Blob::decode_list(st, rest).change_context(Error::BadPlan)?;

        let (filter, rest) =
            if petrel_wire::type_of(rest).change_context(Error::BadPlan)? == Type::Null {
                (None, petrel_wire::read_null(rest).change_context(Error::BadPlan)?)
            } else {
                let (f, rest) = Expr::decode(st, rest)?;
                (Some(f), rest)
            };

        let (next, rest) =
            if petrel_wire::type_of(rest).change_context(Error::BadPlan)? == Type::Null {
                (None, petrel_wire::read_null(rest).change_context(Error::BadPlan)?)
            } else {
                let (n, rest) = Subtables::decode(st, rest, ctor.clone())?;
                (Some(Box::new(n)), rest)
            };

        petrel_wire::expect_consumed(rest).change_context(Error::BadPlan)?;
        for split in &splits {
            if let Some(&bad) = split.blobs.iter().find(|&&i| i >= blobs.len()) {
                return Err(report!(Error::BadPlan)
                    .attach_printable(format!("blob index {bad} out of range")));
            }
        }
        Ok((
            Subtables {
                splits,
                table,
                blobs,
                filter,
                next,
                ctor,
            },
            &body[total..],
        ))
    }

    /// Serialise the chain as a standalone message: the symbol table
    /// followed by the encoded chain.
    pub fn to_message(&self) -> error_stack::Result<Vec<u8>, Error> {
        let mut st = Symtab::new();
        let mut body = Buffer::new();
        self.encode(&mut st, &mut body)?;
        let mut msg = Buffer::new();
        st.encode(&mut msg);
        let mut out = msg.into_vec();
        out.extend_from_slice(body.as_slice());
        Ok(out)
    }

    pub fn from_message(bytes: &[u8], ctor: HandleFn) -> error_stack::Result<Self, Error> {
        let (st, rest) = Symtab::decode(bytes).change_context(Error::BadPlan)?;
        let (subtables, rest) = Subtables::decode(&st, rest, ctor)?;
        petrel_wire::expect_consumed(rest).change_context(Error::BadPlan)?;
        Ok(subtables)
    }
}

impl Clone for Subtables {
    fn clone(&self) -> Self {
        Self {
            splits: self.splits.clone(),
            table: self.table.clone(),
            blobs: self.blobs.clone(),
            filter: self.filter.clone(),
            next: self.next.clone(),
            ctor: self.ctor.clone(),
        }
    }
}

impl std::fmt::Debug for Subtables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subtables")
            .field("splits", &self.splits)
            .field("table", &self.table)
            .field("blobs", &self.blobs.len())
            .field("filter", &self.filter)
            .field("next", &self.next)
            .finish()
    }
}

impl PartialEq for Subtables {
    /// Structural equality; the handle constructor is not part of the
    /// value.
    fn eq(&self, other: &Self) -> bool {
        self.splits == other.splits
            && self.table == other.table
            && self.blobs == other.blobs
            && self.filter == other.filter
            && self.next == other.next
    }
}
