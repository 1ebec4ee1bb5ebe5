use chrono::{DateTime, TimeZone, Utc};
use error_stack::report;

use crate::buffer::unzigzag;
use crate::{
    Error, Sym, Symtab, Type, TAG_BYTES, TAG_FALSE, TAG_FLOAT, TAG_INT, TAG_LIST, TAG_NULL,
    TAG_STRING, TAG_STRUCT, TAG_SYMBOL, TAG_TIMESTAMP, TAG_TRUE,
};

/// Return the type of the first value in `buf`.
pub fn type_of(buf: &[u8]) -> error_stack::Result<Type, Error> {
    match buf.first() {
        None => Err(report!(Error::Truncated)),
        Some(&TAG_NULL) => Ok(Type::Null),
        Some(&TAG_FALSE) | Some(&TAG_TRUE) => Ok(Type::Bool),
        Some(&TAG_INT) => Ok(Type::Int),
        Some(&TAG_FLOAT) => Ok(Type::Float),
        Some(&TAG_TIMESTAMP) => Ok(Type::Timestamp),
        Some(&TAG_STRING) => Ok(Type::String),
        Some(&TAG_BYTES) => Ok(Type::Bytes),
        Some(&TAG_SYMBOL) => Ok(Type::Symbol),
        Some(&TAG_LIST) => Ok(Type::List),
        Some(&TAG_STRUCT) => Ok(Type::Struct),
        Some(&tag) => Err(report!(Error::UnknownTag(tag))),
    }
}

/// Return the total encoded size of the first value in `buf`, including
/// its tag and any length prefix.
pub fn size_of(buf: &[u8]) -> error_stack::Result<usize, Error> {
    let ty = type_of(buf)?;
    let body = &buf[1..];
    match ty {
        Type::Null | Type::Bool => Ok(1),
        Type::Int | Type::Timestamp | Type::Symbol => {
            let (_, rest) = read_uvarint(body)?;
            Ok(buf.len() - rest.len())
        }
        Type::Float => {
            if body.len() < 8 {
                return Err(report!(Error::Truncated));
            }
            Ok(9)
        }
        Type::String | Type::Bytes | Type::List | Type::Struct => {
            let (len, rest) = read_uvarint(body)?;
            let len = len as usize;
            if rest.len() < len {
                return Err(report!(Error::Truncated));
            }
            Ok(buf.len() - rest.len() + len)
        }
    }
}

/// Return the payload of the first value in `buf`, which must be a list
/// or a struct.
pub fn contents(buf: &[u8]) -> error_stack::Result<&[u8], Error> {
    let ty = type_of(buf)?;
    if !matches!(ty, Type::List | Type::Struct) {
        return Err(report!(Error::Unexpected {
            expected: Type::List,
            found: ty,
        }));
    }
    let (len, rest) = read_uvarint(&buf[1..])?;
    let len = len as usize;
    if rest.len() < len {
        return Err(report!(Error::Truncated));
    }
    Ok(&rest[..len])
}

/// Skip a null value, returning the remaining input.
pub fn read_null(buf: &[u8]) -> error_stack::Result<&[u8], Error> {
    expect(buf, Type::Null)?;
    Ok(&buf[1..])
}

pub fn read_bool(buf: &[u8]) -> error_stack::Result<(bool, &[u8]), Error> {
    expect(buf, Type::Bool)?;
    Ok((buf[0] == TAG_TRUE, &buf[1..]))
}

pub fn read_int(buf: &[u8]) -> error_stack::Result<(i64, &[u8]), Error> {
    expect(buf, Type::Int)?;
    let (raw, rest) = read_uvarint(&buf[1..])?;
    Ok((unzigzag(raw), rest))
}

pub fn read_f64(buf: &[u8]) -> error_stack::Result<(f64, &[u8]), Error> {
    expect(buf, Type::Float)?;
    let body = &buf[1..];
    if body.len() < 8 {
        return Err(report!(Error::Truncated));
    }
    let mut le = [0u8; 8];
    le.copy_from_slice(&body[..8]);
    Ok((f64::from_le_bytes(le), &body[8..]))
}

pub fn read_timestamp(buf: &[u8]) -> error_stack::Result<(DateTime<Utc>, &[u8]), Error> {
    expect(buf, Type::Timestamp)?;
    let (raw, rest) = read_uvarint(&buf[1..])?;
    let micros = unzigzag(raw);
    match Utc.timestamp_micros(micros) {
        chrono::LocalResult::Single(ts) => Ok((ts, rest)),
        _ => Err(report!(Error::TimestampRange)),
    }
}

pub fn read_string(buf: &[u8]) -> error_stack::Result<(&str, &[u8]), Error> {
    expect(buf, Type::String)?;
    let (len, rest) = read_uvarint(&buf[1..])?;
    let len = len as usize;
    if rest.len() < len {
        return Err(report!(Error::Truncated));
    }
    let s = std::str::from_utf8(&rest[..len]).map_err(|_| report!(Error::InvalidUtf8))?;
    Ok((s, &rest[len..]))
}

pub fn read_bytes(buf: &[u8]) -> error_stack::Result<(&[u8], &[u8]), Error> {
    expect(buf, Type::Bytes)?;
    let (len, rest) = read_uvarint(&buf[1..])?;
    let len = len as usize;
    if rest.len() < len {
        return Err(report!(Error::Truncated));
    }
    Ok((&rest[..len], &rest[len..]))
}

pub fn read_symbol(buf: &[u8]) -> error_stack::Result<(Sym, &[u8]), Error> {
    expect(buf, Type::Symbol)?;
    let (id, rest) = read_uvarint(&buf[1..])?;
    if id > u32::MAX as u64 {
        return Err(report!(Error::UnknownSymbol(id)));
    }
    Ok((Sym::from_id(id as u32), rest))
}

/// Iterate over the elements of the list at the head of `buf`, calling `f`
/// with the encoding of each element. Returns the input remaining *after*
/// the list.
pub fn unpack_list<F>(buf: &[u8], mut f: F) -> error_stack::Result<&[u8], Error>
where
    F: FnMut(&[u8]) -> error_stack::Result<(), Error>,
{
    let mut body = contents(buf)?;
    let total = size_of(buf)?;
    while !body.is_empty() {
        f(body)?;
        let n = size_of(body)?;
        body = &body[n..];
    }
    Ok(&buf[total..])
}

/// Iterate over the fields of the struct at the head of `buf`, resolving
/// symbol keys against `st`. Returns the input remaining after the struct.
pub fn unpack_struct<'a, F>(
    buf: &'a [u8],
    st: &Symtab,
    mut f: F,
) -> error_stack::Result<&'a [u8], Error>
where
    F: FnMut(&str, &[u8]) -> error_stack::Result<(), Error>,
{
    let ty = type_of(buf)?;
    if ty != Type::Struct {
        return Err(report!(Error::Unexpected {
            expected: Type::Struct,
            found: ty,
        }));
    }
    let mut body = contents(buf)?;
    let total = size_of(buf)?;
    while !body.is_empty() {
        let value;
        match type_of(body)? {
            Type::String => {
                let (name, rest) = read_string(body)?;
                value = rest;
                f(name, value)?;
            }
            Type::Symbol => {
                let (sym, rest) = read_symbol(body)?;
                let name = st
                    .name(sym)
                    .ok_or_else(|| report!(Error::UnknownSymbol(sym.id() as u64)))?;
                value = rest;
                f(name, value)?;
            }
            other => return Err(report!(Error::BadStructKey(other))),
        }
        let n = size_of(value)?;
        body = &value[n..];
    }
    Ok(&buf[total..])
}

/// Trim the null padding that aligned chunks are filled with.
pub fn skip_padding(mut buf: &[u8]) -> &[u8] {
    while let [TAG_NULL, rest @ ..] = buf {
        buf = rest;
    }
    buf
}

/// Require that a decoder consumed its entire input.
///
/// Fixed-shape decoders call this on whatever remains after the declared
/// fields; leftover bytes mean the input does not match the shape.
pub fn expect_consumed(rest: &[u8]) -> error_stack::Result<(), Error> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(report!(Error::TrailingBytes(rest.len())))
    }
}

fn expect(buf: &[u8], want: Type) -> error_stack::Result<(), Error> {
    let found = type_of(buf)?;
    if found != want {
        return Err(report!(Error::Unexpected {
            expected: want,
            found,
        }));
    }
    Ok(())
}

fn read_uvarint(buf: &[u8]) -> error_stack::Result<(u64, &[u8]), Error> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(report!(Error::VarintOverflow));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, &buf[i + 1..]));
        }
        shift += 7;
    }
    Err(report!(Error::Truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Buffer;

    #[test]
    fn test_struct_with_mixed_keys() {
        let mut st = Symtab::new();
        let sym = st.intern("count");

        let mut buf = Buffer::new();
        buf.begin_struct();
        buf.begin_field(sym);
        buf.write_int(7);
        buf.begin_field_name("name");
        buf.write_string("petrel");
        buf.end_struct();
        let bytes = buf.into_vec();

        let mut fields = Vec::new();
        let rest = unpack_struct(&bytes, &st, |name, value| {
            fields.push((name.to_owned(), type_of(value).unwrap()));
            Ok(())
        })
        .unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            fields,
            vec![
                ("count".to_owned(), Type::Int),
                ("name".to_owned(), Type::String)
            ]
        );
    }

    #[test]
    fn test_unknown_symbol_key_rejected() {
        let st = Symtab::new();
        let mut other = Symtab::new();
        let sym = other.intern("ghost");

        let mut buf = Buffer::new();
        buf.begin_struct();
        buf.begin_field(sym);
        buf.write_null();
        buf.end_struct();

        let err = unpack_struct(buf.as_slice(), &st, |_, _| Ok(())).unwrap_err();
        assert!(matches!(
            err.current_context(),
            Error::UnknownSymbol(_)
        ));
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = Buffer::new();
        buf.write_string("truncate me");
        let bytes = buf.into_vec();
        assert!(read_string(&bytes[..4]).is_err());
        assert!(size_of(&bytes[..4]).is_err());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = Utc.with_ymd_and_hms(2023, 6, 15, 12, 30, 45).unwrap();
        let mut buf = Buffer::new();
        buf.write_timestamp(ts);
        let (decoded, rest) = read_timestamp(buf.as_slice()).unwrap();
        assert_eq!(decoded, ts);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_expect_consumed() {
        assert!(expect_consumed(&[]).is_ok());
        let err = expect_consumed(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err.current_context(), Error::TrailingBytes(3)));
    }

    #[test]
    fn test_skip_padding() {
        let mut buf = Buffer::new();
        buf.write_int(5);
        let mut bytes = vec![0u8; 3];
        bytes.extend_from_slice(buf.as_slice());
        let (v, _) = read_int(skip_padding(&bytes)).unwrap();
        assert_eq!(v, 5);
    }
}
