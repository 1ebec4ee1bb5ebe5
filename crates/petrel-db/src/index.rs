use chrono::{DateTime, Utc};
use error_stack::{report, ResultExt};
use petrel_blockfmt::Trailer;
use petrel_wire::{Buffer, Symtab};

use crate::{Error, TenantKey};

/// One packed object referenced by an [`Index`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDesc {
    /// Store-relative path of the object.
    pub path: String,
    pub etag: String,
    pub size: u64,
    /// Present for block-structured objects; raw pass-through objects
    /// have none.
    pub trailer: Option<Trailer>,
}

/// The per-(database, table) descriptor: which objects make up the
/// table, and when the index was written. Immutable once opened.
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    pub db: String,
    pub table: String,
    pub created: DateTime<Utc>,
    pub contents: Vec<ObjectDesc>,
}

impl Index {
    pub fn encode(&self, buf: &mut Buffer) {
        buf.begin_struct();
        buf.begin_field_name("db");
        buf.write_string(&self.db);
        buf.begin_field_name("table");
        buf.write_string(&self.table);
        buf.begin_field_name("created");
        buf.write_timestamp(self.created);
        buf.begin_field_name("contents");
        buf.begin_list();
        for desc in &self.contents {
            buf.begin_struct();
            buf.begin_field_name("path");
            buf.write_string(&desc.path);
            buf.begin_field_name("etag");
            buf.write_string(&desc.etag);
            buf.begin_field_name("size");
            buf.write_int(desc.size as i64);
            if let Some(trailer) = &desc.trailer {
                buf.begin_field_name("trailer");
                trailer.encode(buf);
            }
            buf.end_struct();
        }
        buf.end_list();
        buf.end_struct();
    }

    pub fn decode(body: &[u8]) -> error_stack::Result<Self, Error> {
        let empty = Symtab::new();
        let mut db = None;
        let mut table = None;
        let mut created = None;
        let mut contents = Vec::new();
        let mut nested_err = None;
        petrel_wire::unpack_struct(body, &empty, |name, value| {
            match name {
                "db" => {
                    let (v, _) = petrel_wire::read_string(value)?;
                    db = Some(v.to_owned());
                }
                "table" => {
                    let (v, _) = petrel_wire::read_string(value)?;
                    table = Some(v.to_owned());
                }
                "created" => {
                    let (v, _) = petrel_wire::read_timestamp(value)?;
                    created = Some(v);
                }
                "contents" => {
                    petrel_wire::unpack_list(value, |item| {
                        match decode_object(item) {
                            Ok(desc) => contents.push(desc),
                            Err(e) => {
                                if nested_err.is_none() {
                                    nested_err = Some(e);
                                }
                            }
                        }
                        Ok(())
                    })?;
                }
                _ => {}
            }
            Ok(())
        })
        .change_context(Error::BadIndex)?;
        if let Some(e) = nested_err {
            return Err(e);
        }
        Ok(Index {
            db: db.ok_or_else(|| report!(Error::BadIndex))?,
            table: table.ok_or_else(|| report!(Error::BadIndex))?,
            created: created.ok_or_else(|| report!(Error::BadIndex))?,
            contents,
        })
    }

    /// Serialise and append the tenant-keyed MAC.
    pub fn sign(&self, key: &TenantKey) -> Vec<u8> {
        let mut buf = Buffer::new();
        self.encode(&mut buf);
        let mut bytes = buf.into_vec();
        let mac = key.mac(&bytes);
        bytes.extend_from_slice(&mac.to_le_bytes());
        bytes
    }

    /// Verify the trailing MAC with the tenant key, then decode.
    pub fn open_signed(bytes: &[u8], key: &TenantKey) -> error_stack::Result<Self, Error> {
        if bytes.len() < 8 {
            return Err(report!(Error::BadIndex));
        }
        let (body, tag) = bytes.split_at(bytes.len() - 8);
        let mut expect = [0u8; 8];
        expect.copy_from_slice(tag);
        if key.mac(body) != u64::from_le_bytes(expect) {
            return Err(report!(Error::BadSignature));
        }
        Self::decode(body)
    }
}

fn decode_object(item: &[u8]) -> error_stack::Result<ObjectDesc, Error> {
    let empty = Symtab::new();
    let mut path = None;
    let mut etag = None;
    let mut size = 0u64;
    let mut trailer = None;
    let mut nested_err = None;
    petrel_wire::unpack_struct(item, &empty, |name, value| {
        match name {
            "path" => {
                let (v, _) = petrel_wire::read_string(value)?;
                path = Some(v.to_owned());
            }
            "etag" => {
                let (v, _) = petrel_wire::read_string(value)?;
                etag = Some(v.to_owned());
            }
            "size" => {
                let (v, _) = petrel_wire::read_int(value)?;
                size = v as u64;
            }
            "trailer" => match Trailer::decode(value) {
                Ok((t, _)) => trailer = Some(t),
                Err(e) => nested_err = Some(e.change_context(Error::BadIndex)),
            },
            _ => {}
        }
        Ok(())
    })
    .change_context(Error::BadIndex)?;
    if let Some(e) = nested_err {
        return Err(e);
    }
    Ok(ObjectDesc {
        path: path.ok_or_else(|| report!(Error::BadIndex))?,
        etag: etag.ok_or_else(|| report!(Error::BadIndex))?,
        size,
        trailer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use petrel_blockfmt::{BlockDesc, SparseIndex};

    fn sample() -> Index {
        Index {
            db: "telemetry".to_owned(),
            table: "events".to_owned(),
            created: Utc.timestamp_opt(1_690_000_000, 0).unwrap(),
            contents: vec![
                ObjectDesc {
                    path: "db/telemetry/events/packed-0".to_owned(),
                    etag: "etag-0".to_owned(),
                    size: 2048,
                    trailer: Some(Trailer {
                        version: 1,
                        algo: "zstd".to_owned(),
                        align: 1 << 10,
                        offset: 1500,
                        blocks: vec![BlockDesc {
                            offset: 0,
                            chunks: 3,
                        }],
                        sparse: SparseIndex::default(),
                        created: Utc.timestamp_opt(1_689_999_999, 0).unwrap(),
                    }),
                },
                ObjectDesc {
                    path: "db/telemetry/events/raw-1".to_owned(),
                    etag: "etag-1".to_owned(),
                    size: 99,
                    trailer: None,
                },
            ],
        }
    }

    #[test]
    fn test_sign_open_round_trip() {
        let key = TenantKey::new([3u8; 32]);
        let index = sample();
        let signed = index.sign(&key);
        let opened = Index::open_signed(&signed, &key).unwrap();
        assert_eq!(opened, index);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let index = sample();
        let signed = index.sign(&TenantKey::new([3u8; 32]));
        let err = Index::open_signed(&signed, &TenantKey::new([4u8; 32])).unwrap_err();
        assert!(matches!(err.current_context(), Error::BadSignature));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let key = TenantKey::new([3u8; 32]);
        let mut signed = sample().sign(&key);
        signed[10] ^= 0xff;
        assert!(Index::open_signed(&signed, &key).is_err());
    }
}
