use std::io::Read;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use error_stack::{report, IntoReport, ResultExt};
use petrel_wire::Buffer;
use serde_json::Value;

use crate::{Chunker, Error, FieldPath};

/// Schema guidance for the JSON row formats.
///
/// Hints name the fields whose min/max values should be tracked in the
/// sparse index, as dotted paths into each row:
///
/// ```json
/// {"indexed": ["eventTime", "created.at"]}
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hints {
    pub indexed: Vec<FieldPath>,
}

#[derive(serde::Deserialize)]
struct RawHints {
    #[serde(default)]
    indexed: Vec<String>,
}

impl Hints {
    pub fn parse(bytes: &[u8]) -> error_stack::Result<Self, Error> {
        let raw: RawHints = serde_json::from_slice(bytes)
            .into_report()
            .change_context(Error::BadHints)?;
        Ok(Hints {
            indexed: raw
                .indexed
                .iter()
                .map(|path| path.split('.').map(|p| p.to_owned()).collect())
                .collect(),
        })
    }
}

/// Records the first I/O error the wrapped reader yields, so a failure
/// surfacing through a decoding layer above can be traced back to the
/// source stream.
pub(crate) struct ErrorTap<R> {
    inner: R,
    seen: Arc<Mutex<Option<(std::io::ErrorKind, String)>>>,
}

impl<R> ErrorTap<R> {
    pub(crate) fn new(inner: R) -> (Self, Arc<Mutex<Option<(std::io::ErrorKind, String)>>>) {
        let seen = Arc::new(Mutex::new(None));
        (
            Self {
                inner,
                seen: seen.clone(),
            },
            seen,
        )
    }
}

impl<R: Read> Read for ErrorTap<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let mut seen = self.seen.lock().unwrap();
                if seen.is_none() {
                    *seen = Some((e.kind(), e.to_string()));
                }
                Err(e)
            }
        }
    }
}

/// Convert a stream of JSON values into encoded rows.
///
/// The stream may be newline-delimited or simply concatenated values.
/// Every top-level value must be an object; in CloudTrail mode the
/// top-level object must carry a `Records` array whose elements become
/// the rows.
pub(crate) fn convert_json<R: Read>(
    src: R,
    dst: &mut Chunker,
    hints: Option<&Hints>,
    cloudtrail: bool,
    source_errors: Option<&Mutex<Option<(std::io::ErrorKind, String)>>>,
    decomp_name: Option<&'static str>,
) -> error_stack::Result<(), Error> {
    let indexed: Vec<FieldPath> = match hints {
        Some(h) => h.indexed.clone(),
        None if cloudtrail => vec![vec!["eventTime".to_owned()]],
        None => Vec::new(),
    };
    let mut buf = Buffer::new();
    let mut times: Vec<(FieldPath, DateTime<Utc>)> = Vec::new();
    let stream = serde_json::Deserializer::from_reader(src).into_iter::<Value>();
    for value in stream {
        let value = match value {
            Ok(v) => v,
            Err(e) => return Err(classify_json_error(e, source_errors, decomp_name)),
        };
        if cloudtrail {
            let records = value
                .as_object()
                .and_then(|o| o.get("Records"))
                .and_then(|r| r.as_array());
            let Some(records) = records else {
                return Err(report!(Error::NoMatch)
                    .attach_printable("cloudtrail object has no Records array"));
            };
            for record in records {
                write_row(record, dst, &indexed, &mut buf, &mut times)?;
            }
        } else {
            write_row(&value, dst, &indexed, &mut buf, &mut times)?;
        }
    }
    Ok(())
}

fn write_row(
    value: &Value,
    dst: &mut Chunker,
    indexed: &[FieldPath],
    buf: &mut Buffer,
    times: &mut Vec<(FieldPath, DateTime<Utc>)>,
) -> error_stack::Result<(), Error> {
    if !value.is_object() {
        return Err(report!(Error::NoMatch).attach_printable("row is not a JSON object"));
    }
    buf.clear();
    encode_value(buf, value);
    times.clear();
    for path in indexed {
        if let Some(ts) = lookup_time(value, path) {
            times.push((path.clone(), ts));
        }
    }
    dst.write_record(buf.as_slice(), times)
}

/// Encode a JSON value as a wire value. Strings that parse as RFC 3339
/// timestamps are stored as native timestamps, which is what makes the
/// sparse index possible without a declared schema.
fn encode_value(buf: &mut Buffer, value: &Value) {
    match value {
        Value::Null => buf.write_null(),
        Value::Bool(b) => buf.write_bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                buf.write_int(i);
            } else {
                buf.write_f64(n.as_f64().unwrap_or(f64::NAN));
            }
        }
        Value::String(s) => match parse_time(s) {
            Some(ts) => buf.write_timestamp(ts),
            None => buf.write_string(s),
        },
        Value::Array(items) => {
            buf.begin_list();
            for item in items {
                encode_value(buf, item);
            }
            buf.end_list();
        }
        Value::Object(fields) => {
            buf.begin_struct();
            for (name, item) in fields {
                buf.begin_field_name(name);
                encode_value(buf, item);
            }
            buf.end_struct();
        }
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn lookup_time(value: &Value, path: &[String]) -> Option<DateTime<Utc>> {
    let mut cur = value;
    for part in path {
        cur = cur.as_object()?.get(part)?;
    }
    parse_time(cur.as_str()?)
}

fn classify_json_error(
    e: serde_json::Error,
    source_errors: Option<&Mutex<Option<(std::io::ErrorKind, String)>>>,
    decomp_name: Option<&'static str>,
) -> error_stack::Report<Error> {
    if e.is_io() {
        // An I/O failure recorded at the source stream is transient; one
        // that appeared above the source came from the decompressor and
        // means the stream itself is damaged.
        if let Some(seen) = source_errors {
            if let Some((kind, msg)) = seen.lock().unwrap().take() {
                return report!(Error::Read)
                    .attach_printable(format!("source stream: {msg} ({kind:?})"));
            }
        }
        if let Some(name) = decomp_name {
            return report!(e).change_context(Error::Corrupt(name));
        }
        return report!(e).change_context(Error::Read);
    }
    report!(e).change_context(Error::Syntax)
}
