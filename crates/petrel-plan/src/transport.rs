use std::net::SocketAddr;

use error_stack::{report, ResultExt};
use petrel_wire::{Buffer, Symtab};
use uuid::Uuid;

use crate::Error;

/// Where a sub-table executes: in-process, or on a peer worker reached
/// over TCP and tagged with the worker/tenant id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Local,
    Remote { worker: Uuid, addr: SocketAddr },
}

impl Transport {
    pub fn encode(&self, st: &mut Symtab, buf: &mut Buffer) {
        buf.begin_list();
        match self {
            Transport::Local => {
                buf.write_symbol(st.intern("local"));
            }
            Transport::Remote { worker, addr } => {
                buf.write_symbol(st.intern("remote"));
                buf.write_bytes(worker.as_bytes());
                buf.write_string(&addr.to_string());
            }
        }
        buf.end_list();
    }

    /// Decode one transport, returning the remaining input.
    pub fn decode<'a>(
        st: &Symtab,
        body: &'a [u8],
    ) -> error_stack::Result<(Self, &'a [u8]), Error> {
        let total = petrel_wire::size_of(body).change_context(Error::BadPlan)?;
        let inner = petrel_wire::contents(body).change_context(Error::BadPlan)?;
        let (sym, rest) = petrel_wire::read_symbol(inner).change_context(Error::BadPlan)?;
        let kind = st.name(sym).ok_or_else(|| report!(Error::BadPlan))?;
        let transport = match kind {
            "local" => {
                // local carries no fields
                petrel_wire::expect_consumed(rest).change_context(Error::BadPlan)?;
                Transport::Local
            }
            "remote" => {
                let (id, rest) = petrel_wire::read_bytes(rest).change_context(Error::BadPlan)?;
                let worker = Uuid::from_slice(id)
                    .map_err(|_| report!(Error::BadPlan))
                    .attach_printable("worker id must be 16 bytes")?;
                let (addr, rest) =
                    petrel_wire::read_string(rest).change_context(Error::BadPlan)?;
                let addr: SocketAddr = addr
                    .parse()
                    .map_err(|_| report!(Error::BadPlan))
                    .attach_printable_lazy(|| format!("bad peer address {addr:?}"))?;
                petrel_wire::expect_consumed(rest).change_context(Error::BadPlan)?;
                Transport::Remote { worker, addr }
            }
            other => {
                return Err(report!(Error::BadPlan)
                    .attach_printable(format!("unknown transport {other:?}")))
            }
        };
        Ok((transport, &body[total..]))
    }
}
