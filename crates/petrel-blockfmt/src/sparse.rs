use chrono::{DateTime, Utc};
use error_stack::{report, ResultExt};
use petrel_wire::{Buffer, Symtab};

use crate::Error;

/// A dotted field path into ingested rows, e.g. `["created", "at"]`.
pub type FieldPath = Vec<String>;

/// Inclusive min/max bounds observed for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(min: DateTime<Utc>, max: DateTime<Utc>) -> Self {
        Self { min, max }
    }

    pub fn at(ts: DateTime<Utc>) -> Self {
        Self { min: ts, max: ts }
    }

    pub fn union(&mut self, other: &TimeRange) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn add(&mut self, ts: DateTime<Utc>) {
        self.min = self.min.min(ts);
        self.max = self.max.max(ts);
    }
}

/// Ranges accumulated for a set of fields, keyed by path.
///
/// The set stays tiny (one entry per indexed field), so it is a plain
/// vector scanned linearly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeSet {
    entries: Vec<(FieldPath, TimeRange)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note(&mut self, path: &[String], ts: DateTime<Utc>) {
        for (p, range) in &mut self.entries {
            if p == path {
                range.add(ts);
                return;
            }
        }
        self.entries.push((path.to_vec(), TimeRange::at(ts)));
    }

    pub fn union(&mut self, other: &RangeSet) {
        for (path, range) in &other.entries {
            match self.entries.iter_mut().find(|(p, _)| p == path) {
                Some((_, mine)) => mine.union(range),
                None => self.entries.push((path.clone(), *range)),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &TimeRange)> {
        self.entries.iter().map(|(p, r)| (p, r))
    }
}

/// Per-block min/max summaries for the indexed fields of one object.
///
/// Answers "can block `i` contain a value of `path` in some interval"
/// with `never` or `maybe`; the block format never stores enough to say
/// `always`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseIndex {
    blocks: usize,
    fields: Vec<FieldRanges>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRanges {
    pub path: FieldPath,
    /// One entry per block; `None` when the block recorded no value for
    /// this field.
    pub ranges: Vec<Option<TimeRange>>,
}

impl SparseIndex {
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn fields(&self) -> &[FieldRanges] {
        &self.fields
    }

    /// Append one block summarised by `ranges`.
    ///
    /// Fields absent from `ranges` get a `None` entry; fields never seen
    /// before are back-filled with `None` for all prior blocks.
    pub fn push_block(&mut self, ranges: &RangeSet) {
        for field in &mut self.fields {
            let range = ranges
                .iter()
                .find(|(p, _)| *p == &field.path)
                .map(|(_, r)| *r);
            field.ranges.push(range);
        }
        for (path, range) in ranges.iter() {
            if self.fields.iter().any(|f| &f.path == path) {
                continue;
            }
            let mut blocks = vec![None; self.blocks];
            blocks.push(Some(*range));
            self.fields.push(FieldRanges {
                path: path.clone(),
                ranges: blocks,
            });
        }
        self.blocks += 1;
    }

    pub fn field(&self, path: &[String]) -> Option<&FieldRanges> {
        self.fields.iter().find(|f| f.path == path)
    }

    pub fn range(&self, path: &[String], block: usize) -> Option<TimeRange> {
        self.field(path)?.ranges.get(block).copied().flatten()
    }

    /// The ranges recorded for one block, across all fields.
    pub fn block_ranges(&self, block: usize) -> RangeSet {
        let mut out = RangeSet::new();
        for field in &self.fields {
            if let Some(Some(range)) = field.ranges.get(block) {
                match out.entries.iter_mut().find(|(p, _)| p == &field.path) {
                    Some((_, mine)) => mine.union(range),
                    None => out.entries.push((field.path.clone(), *range)),
                }
            }
        }
        out
    }

    /// Concatenate `other`'s blocks after this index's blocks.
    ///
    /// Used when stitching per-lane indexes into one trailer.
    pub fn append(&mut self, other: &SparseIndex) {
        for _ in 0..other.blocks {
            // Reserve the new block slots first so the back-fill logic in
            // push_block is not duplicated here.
            for field in &mut self.fields {
                field.ranges.push(None);
            }
            self.blocks += 1;
        }
        let base = self.blocks - other.blocks;
        for theirs in &other.fields {
            match self.fields.iter_mut().find(|f| f.path == theirs.path) {
                Some(mine) => {
                    for (i, range) in theirs.ranges.iter().enumerate() {
                        mine.ranges[base + i] = *range;
                    }
                }
                None => {
                    let mut ranges = vec![None; base];
                    ranges.extend(theirs.ranges.iter().copied());
                    self.fields.push(FieldRanges {
                        path: theirs.path.clone(),
                        ranges,
                    });
                }
            }
        }
    }

    pub fn encode(&self, buf: &mut Buffer) {
        buf.begin_struct();
        buf.begin_field_name("blocks");
        buf.write_int(self.blocks as i64);
        buf.begin_field_name("fields");
        buf.begin_list();
        for field in &self.fields {
            buf.begin_struct();
            buf.begin_field_name("path");
            buf.begin_list();
            for part in &field.path {
                buf.write_string(part);
            }
            buf.end_list();
            buf.begin_field_name("ranges");
            buf.begin_list();
            for range in &field.ranges {
                match range {
                    None => buf.write_null(),
                    Some(r) => {
                        buf.begin_list();
                        buf.write_timestamp(r.min);
                        buf.write_timestamp(r.max);
                        buf.end_list();
                    }
                }
            }
            buf.end_list();
            buf.end_struct();
        }
        buf.end_list();
        buf.end_struct();
    }

    pub fn decode(body: &[u8]) -> error_stack::Result<(Self, &[u8]), Error> {
        let empty = Symtab::new();
        let mut out = SparseIndex::default();
        let rest = petrel_wire::unpack_struct(body, &empty, |name, value| {
            match name {
                "blocks" => {
                    let (n, _) = petrel_wire::read_int(value)?;
                    out.blocks = n as usize;
                }
                "fields" => {
                    petrel_wire::unpack_list(value, |item| {
                        let field = decode_field(item, &empty)?;
                        out.fields.push(field);
                        Ok(())
                    })?;
                }
                _ => {}
            }
            Ok(())
        })
        .change_context(Error::BadTrailer)?;
        for field in &out.fields {
            if field.ranges.len() != out.blocks {
                return Err(report!(Error::BadTrailer));
            }
        }
        Ok((out, rest))
    }
}

fn decode_field(
    item: &[u8],
    empty: &Symtab,
) -> error_stack::Result<FieldRanges, petrel_wire::Error> {
    let mut path = FieldPath::new();
    let mut ranges = Vec::new();
    petrel_wire::unpack_struct(item, empty, |name, value| {
        match name {
            "path" => {
                petrel_wire::unpack_list(value, |part| {
                    let (s, _) = petrel_wire::read_string(part)?;
                    path.push(s.to_owned());
                    Ok(())
                })?;
            }
            "ranges" => {
                petrel_wire::unpack_list(value, |entry| {
                    if petrel_wire::type_of(entry)? == petrel_wire::Type::Null {
                        ranges.push(None);
                        return Ok(());
                    }
                    let body = petrel_wire::contents(entry)?;
                    let (min, rest) = petrel_wire::read_timestamp(body)?;
                    let (max, _) = petrel_wire::read_timestamp(rest)?;
                    ranges.push(Some(TimeRange::new(min, max)));
                    Ok(())
                })?;
            }
            _ => {}
        }
        Ok(())
    })?;
    Ok(FieldRanges { path, ranges })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn path(s: &str) -> FieldPath {
        s.split('.').map(|p| p.to_owned()).collect()
    }

    #[test]
    fn test_push_block_backfills_new_fields() {
        let mut sparse = SparseIndex::default();

        let mut first = RangeSet::new();
        first.note(&path("ts"), ts(100));
        first.note(&path("ts"), ts(200));
        sparse.push_block(&first);

        let mut second = RangeSet::new();
        second.note(&path("other"), ts(50));
        sparse.push_block(&second);

        assert_eq!(sparse.blocks(), 2);
        assert_eq!(
            sparse.range(&path("ts"), 0),
            Some(TimeRange::new(ts(100), ts(200)))
        );
        assert_eq!(sparse.range(&path("ts"), 1), None);
        assert_eq!(sparse.range(&path("other"), 0), None);
        assert_eq!(
            sparse.range(&path("other"), 1),
            Some(TimeRange::new(ts(50), ts(50)))
        );
    }

    #[test]
    fn test_append_concatenates_blocks() {
        let mut left = SparseIndex::default();
        let mut r = RangeSet::new();
        r.note(&path("ts"), ts(10));
        left.push_block(&r);

        let mut right = SparseIndex::default();
        let mut r2 = RangeSet::new();
        r2.note(&path("ts"), ts(99));
        right.push_block(&RangeSet::new());
        right.push_block(&r2);

        left.append(&right);
        assert_eq!(left.blocks(), 3);
        assert_eq!(left.range(&path("ts"), 0), Some(TimeRange::at(ts(10))));
        assert_eq!(left.range(&path("ts"), 1), None);
        assert_eq!(left.range(&path("ts"), 2), Some(TimeRange::at(ts(99))));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut sparse = SparseIndex::default();
        let mut r = RangeSet::new();
        r.note(&path("created.at"), ts(1000));
        r.note(&path("created.at"), ts(2000));
        sparse.push_block(&r);
        sparse.push_block(&RangeSet::new());

        let mut buf = Buffer::new();
        sparse.encode(&mut buf);
        let (decoded, rest) = SparseIndex::decode(buf.as_slice()).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, sparse);
    }
}
