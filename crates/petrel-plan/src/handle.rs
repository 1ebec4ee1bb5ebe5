use error_stack::ResultExt;
use petrel_db::Blob;
use petrel_wire::{Buffer, Symtab, Type};

use crate::filter::{compile, CompiledFilter};
use crate::{Error, Expr};

/// A resolved table: enough state to open the table's data on whichever
/// worker the plan lands on.
pub trait TableHandle: Send + Sync {
    fn encode(&self, st: &mut Symtab, buf: &mut Buffer) -> error_stack::Result<(), Error>;

    /// Concrete-type access for components that only work with one
    /// handle shape (the splitter requires the filter-carrying variant).
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The handle produced by [`Env::stat`](crate::Env::stat): the original
/// predicate, its block-level compilation, and the blobs that survived
/// pushdown.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterHandle {
    pub filter: Option<Expr>,
    pub compiled: Option<CompiledFilter>,
    pub blobs: Vec<Blob>,
}

impl FilterHandle {
    pub fn new(blobs: Vec<Blob>, filter: Option<Expr>) -> Self {
        let compiled = filter.as_ref().and_then(compile);
        Self {
            filter,
            compiled,
            blobs,
        }
    }

    /// Decode a handle written by [`TableHandle::encode`], returning the
    /// remaining input.
    pub fn decode<'a>(
        st: &Symtab,
        body: &'a [u8],
    ) -> error_stack::Result<(Self, &'a [u8]), Error> {
        let total = petrel_wire::size_of(body).change_context(Error::BadPlan)?;
        let inner = petrel_wire::contents(body).change_context(Error::BadPlan)?;
        let (blobs, rest) = Blob::decode_list(st, inner).change_context(Error::BadPlan)?;
        let filter = if petrel_wire::type_of(rest).change_context(Error::BadPlan)? == Type::Null {
            let rest = petrel_wire::read_null(rest).change_context(Error::BadPlan)?;
            petrel_wire::expect_consumed(rest).change_context(Error::BadPlan)?;
            None
        } else {
            let (expr, rest) = Expr::decode(st, rest)?;
            petrel_wire::expect_consumed(rest).change_context(Error::BadPlan)?;
            Some(expr)
        };
        Ok((Self::new(blobs, filter), &body[total..]))
    }
}

impl TableHandle for FilterHandle {
    /// Encoded as `[blobs, filterOrNull]`; the compiled form is derived,
    /// not shipped.
    fn encode(&self, st: &mut Symtab, buf: &mut Buffer) -> error_stack::Result<(), Error> {
        buf.begin_list();
        Blob::encode_list(&self.blobs, st, buf);
        match &self.filter {
            None => buf.write_null(),
            Some(f) => f.encode(st, buf),
        }
        buf.end_list();
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CmpOp;
    use chrono::{TimeZone, Utc};
    use petrel_db::OpaqueBlob;

    fn handle() -> FilterHandle {
        FilterHandle::new(
            vec![Blob::Opaque(OpaqueBlob {
                path: "raw/x.json".to_owned(),
                etag: "etag-x".to_owned(),
                size: 10,
            })],
            Some(Expr::compare(
                CmpOp::Lt,
                Expr::path(&["ts"]),
                Expr::Timestamp(Utc.timestamp_opt(1000, 0).unwrap()),
            )),
        )
    }

    #[test]
    fn test_round_trip_recompiles_filter() {
        let h = handle();
        assert!(h.compiled.is_some());
        let mut st = Symtab::new();
        let mut buf = Buffer::new();
        h.encode(&mut st, &mut buf).unwrap();
        let (decoded, rest) = FilterHandle::decode(&st, buf.as_slice()).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, h);
    }

    #[test]
    fn test_absent_filter_round_trip() {
        let h = FilterHandle::new(Vec::new(), None);
        let mut st = Symtab::new();
        let mut buf = Buffer::new();
        h.encode(&mut st, &mut buf).unwrap();
        let (decoded, _) = FilterHandle::decode(&st, buf.as_slice()).unwrap();
        assert_eq!(decoded.filter, None);
        assert!(decoded.blobs.is_empty());
    }
}
