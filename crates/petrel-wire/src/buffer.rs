use chrono::{DateTime, Utc};

use crate::{
    Sym, TAG_BYTES, TAG_FALSE, TAG_FLOAT, TAG_INT, TAG_LIST, TAG_NULL, TAG_STRING, TAG_STRUCT,
    TAG_SYMBOL, TAG_TIMESTAMP, TAG_TRUE,
};

/// An append-only encoder for wire values.
///
/// Containers are written with [`Buffer::begin_list`] / [`Buffer::end_list`]
/// (and the struct equivalents); the byte-length prefix is patched in when
/// the container ends, so callers never need to know sizes up front.
#[derive(Default)]
pub struct Buffer {
    buf: Vec<u8>,
    // Offsets of the tag bytes of currently-open containers.
    open: Vec<usize>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        debug_assert!(self.open.is_empty(), "unclosed container");
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        debug_assert!(self.open.is_empty(), "unclosed container");
        self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.open.clear();
    }

    pub fn write_null(&mut self) {
        self.buf.push(TAG_NULL);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(if v { TAG_TRUE } else { TAG_FALSE });
    }

    pub fn write_int(&mut self, v: i64) {
        self.buf.push(TAG_INT);
        write_uvarint(&mut self.buf, zigzag(v));
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.push(TAG_FLOAT);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Timestamps are stored as signed microseconds since the Unix epoch.
    pub fn write_timestamp(&mut self, v: DateTime<Utc>) {
        self.buf.push(TAG_TIMESTAMP);
        write_uvarint(&mut self.buf, zigzag(v.timestamp_micros()));
    }

    pub fn write_string(&mut self, v: &str) {
        self.buf.push(TAG_STRING);
        write_uvarint(&mut self.buf, v.len() as u64);
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.push(TAG_BYTES);
        write_uvarint(&mut self.buf, v.len() as u64);
        self.buf.extend_from_slice(v);
    }

    pub fn write_symbol(&mut self, sym: Sym) {
        self.buf.push(TAG_SYMBOL);
        write_uvarint(&mut self.buf, sym.id() as u64);
    }

    pub fn begin_list(&mut self) {
        self.open.push(self.buf.len());
        self.buf.push(TAG_LIST);
    }

    pub fn end_list(&mut self) {
        self.end_container(TAG_LIST);
    }

    pub fn begin_struct(&mut self) {
        self.open.push(self.buf.len());
        self.buf.push(TAG_STRUCT);
    }

    pub fn end_struct(&mut self) {
        self.end_container(TAG_STRUCT);
    }

    /// Begin a struct field keyed by an interned symbol.
    ///
    /// The field's value must be written immediately afterwards.
    pub fn begin_field(&mut self, sym: Sym) {
        self.write_symbol(sym);
    }

    /// Begin a struct field keyed by an inline string.
    ///
    /// Used for self-contained data (rows) that must decode without a
    /// surrounding symbol table.
    pub fn begin_field_name(&mut self, name: &str) {
        self.write_string(name);
    }

    fn end_container(&mut self, tag: u8) {
        let at = self.open.pop().expect("end_container without begin");
        debug_assert_eq!(self.buf[at], tag, "mismatched container begin/end");
        let body_len = (self.buf.len() - at - 1) as u64;
        let mut prefix = Vec::with_capacity(10);
        write_uvarint(&mut prefix, body_len);
        self.buf.splice(at + 1..at + 1, prefix);
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub(crate) fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub(crate) fn write_uvarint(dst: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            dst.push(byte);
            return;
        }
        dst.push(byte | 0x80);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_int, read_string, size_of, type_of, unpack_list, Type};

    #[test]
    fn test_scalar_round_trip() {
        let mut buf = Buffer::new();
        buf.write_int(-42);
        buf.write_string("hello");
        let bytes = buf.into_vec();

        let (v, rest) = read_int(&bytes).unwrap();
        assert_eq!(v, -42);
        let (s, rest) = read_string(rest).unwrap();
        assert_eq!(s, "hello");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_nested_lists_patch_lengths() {
        let mut buf = Buffer::new();
        buf.begin_list();
        buf.write_int(1);
        buf.begin_list();
        buf.write_int(2);
        buf.write_int(3);
        buf.end_list();
        buf.end_list();
        let bytes = buf.into_vec();

        assert_eq!(type_of(&bytes).unwrap(), Type::List);
        assert_eq!(size_of(&bytes).unwrap(), bytes.len());

        let mut seen = Vec::new();
        let rest = unpack_list(&bytes, |item| {
            seen.push(type_of(item).unwrap());
            Ok(())
        })
        .unwrap();
        assert!(rest.is_empty());
        assert_eq!(seen, vec![Type::Int, Type::List]);
    }

    #[test]
    fn test_long_list_needs_wide_length_prefix() {
        let mut buf = Buffer::new();
        buf.begin_list();
        for i in 0..100 {
            buf.write_string(&format!("element-{i}"));
        }
        buf.end_list();
        let bytes = buf.into_vec();
        assert_eq!(size_of(&bytes).unwrap(), bytes.len());

        let mut n = 0;
        unpack_list(&bytes, |_| {
            n += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 100);
    }

    #[test]
    fn test_zigzag() {
        for v in [0, 1, -1, i64::MAX, i64::MIN, 123456789, -987654321] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }
}
