use error_stack::report;
use hashbrown::HashMap;

use crate::{Buffer, Error};

/// An interned string identifier, valid only with the [`Symtab`] that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sym(u32);

impl Sym {
    pub(crate) fn from_id(id: u32) -> Self {
        Sym(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

/// A symbol table shared by the values of one encoded message.
///
/// Interning is append-only; symbol ids are dense and assigned in
/// first-intern order, so encoding the table and replaying the interns on
/// the decode side yields identical ids.
#[derive(Default, Debug)]
pub struct Symtab {
    names: Vec<String>,
    ids: HashMap<String, Sym>,
}

impl Symtab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> Sym {
        if let Some(sym) = self.ids.get(name) {
            return *sym;
        }
        let sym = Sym(self.names.len() as u32);
        self.names.push(name.to_owned());
        self.ids.insert(name.to_owned(), sym);
        sym
    }

    pub fn name(&self, sym: Sym) -> Option<&str> {
        self.names.get(sym.0 as usize).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Encode the table as a list of strings in id order.
    pub fn encode(&self, buf: &mut Buffer) {
        buf.begin_list();
        for name in &self.names {
            buf.write_string(name);
        }
        buf.end_list();
    }

    /// Decode a table previously written by [`Symtab::encode`], returning
    /// the remaining input.
    pub fn decode(buf: &[u8]) -> error_stack::Result<(Self, &[u8]), Error> {
        let mut st = Symtab::new();
        let mut seen = 0usize;
        let rest = crate::unpack_list(buf, |item| {
            let (name, _) = crate::read_string(item)?;
            st.intern(name);
            seen += 1;
            if st.names.len() != seen {
                // A duplicate name would renumber every later symbol.
                return Err(report!(Error::DuplicateSymbol));
            }
            Ok(())
        })?;
        Ok((st, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let mut st = Symtab::new();
        let a = st.intern("alpha");
        let b = st.intern("beta");
        assert_ne!(a, b);
        assert_eq!(st.intern("alpha"), a);
        assert_eq!(st.len(), 2);
    }

    #[test]
    fn test_encode_decode_preserves_ids() {
        let mut st = Symtab::new();
        let names = ["transport", "addr", "tenant", "transport"];
        let syms: Vec<_> = names.iter().map(|n| st.intern(n)).collect();

        let mut buf = Buffer::new();
        st.encode(&mut buf);
        let (decoded, rest) = Symtab::decode(buf.as_slice()).unwrap();
        assert!(rest.is_empty());

        for (name, sym) in names.iter().zip(&syms) {
            assert_eq!(decoded.name(*sym), Some(*name));
        }
    }
}
