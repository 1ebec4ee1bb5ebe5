use chrono::{DateTime, Utc};
use error_stack::{report, ResultExt};
use petrel_blockfmt::FieldPath;
use petrel_wire::{Buffer, Sym, Symtab, Type};

use crate::Error;

/// A dotted reference like `db.table` or `created.at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    pub first: String,
    pub rest: Vec<String>,
}

impl PathExpr {
    pub fn new(first: impl Into<String>) -> Self {
        Self {
            first: first.into(),
            rest: Vec::new(),
        }
    }

    pub fn dotted(parts: &[&str]) -> Self {
        Self {
            first: parts[0].to_owned(),
            rest: parts[1..].iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    pub fn field_path(&self) -> FieldPath {
        let mut out = Vec::with_capacity(1 + self.rest.len());
        out.push(self.first.clone());
        out.extend(self.rest.iter().cloned());
        out
    }
}

impl std::fmt::Display for PathExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.first)?;
        for part in &self.rest {
            write!(f, ".{part}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl CmpOp {
    fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "=",
            CmpOp::Ge => ">=",
            CmpOp::Gt => ">",
        }
    }

    fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            "=" => Some(CmpOp::Eq),
            ">=" => Some(CmpOp::Ge),
            ">" => Some(CmpOp::Gt),
            _ => None,
        }
    }

    /// The comparison with its operands swapped.
    pub fn flipped(&self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ge => CmpOp::Le,
            CmpOp::Gt => CmpOp::Lt,
        }
    }
}

/// The expression subset the planner works with: table references and
/// pushdown predicates. The SQL front-end produces these; it is not this
/// crate's concern.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Path(PathExpr),
    String(String),
    Int(i64),
    Timestamp(DateTime<Utc>),
    Bool(bool),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn path(parts: &[&str]) -> Self {
        Expr::Path(PathExpr::dotted(parts))
    }

    pub fn compare(op: CmpOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Compare(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Expr::And(Box::new(lhs), Box::new(rhs))
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Self {
        Expr::Or(Box::new(lhs), Box::new(rhs))
    }

    /// Encode as `[kind, args…]` with interned kind markers.
    pub fn encode(&self, st: &mut Symtab, buf: &mut Buffer) {
        let kind = |st: &mut Symtab, name: &str| -> Sym { st.intern(name) };
        buf.begin_list();
        match self {
            Expr::Path(p) => {
                buf.write_symbol(kind(st, "path"));
                buf.write_string(&p.first);
                for part in &p.rest {
                    buf.write_string(part);
                }
            }
            Expr::String(s) => {
                buf.write_symbol(kind(st, "str"));
                buf.write_string(s);
            }
            Expr::Int(v) => {
                buf.write_symbol(kind(st, "int"));
                buf.write_int(*v);
            }
            Expr::Timestamp(ts) => {
                buf.write_symbol(kind(st, "ts"));
                buf.write_timestamp(*ts);
            }
            Expr::Bool(b) => {
                buf.write_symbol(kind(st, "bool"));
                buf.write_bool(*b);
            }
            Expr::Compare(op, lhs, rhs) => {
                buf.write_symbol(kind(st, "cmp"));
                buf.write_symbol(kind(st, op.symbol()));
                lhs.encode(st, buf);
                rhs.encode(st, buf);
            }
            Expr::And(lhs, rhs) => {
                buf.write_symbol(kind(st, "and"));
                lhs.encode(st, buf);
                rhs.encode(st, buf);
            }
            Expr::Or(lhs, rhs) => {
                buf.write_symbol(kind(st, "or"));
                lhs.encode(st, buf);
                rhs.encode(st, buf);
            }
        }
        buf.end_list();
    }

    /// Decode one expression, returning the remaining input.
    pub fn decode<'a>(
        st: &Symtab,
        body: &'a [u8],
    ) -> error_stack::Result<(Self, &'a [u8]), Error> {
        let total = petrel_wire::size_of(body).change_context(Error::BadPlan)?;
        let mut inner = petrel_wire::contents(body).change_context(Error::BadPlan)?;
        let (sym, rest) = petrel_wire::read_symbol(inner).change_context(Error::BadPlan)?;
        inner = rest;
        let kind = st
            .name(sym)
            .ok_or_else(|| report!(Error::BadPlan))?
            .to_owned();
        let expr = match kind.as_str() {
            "path" => {
                let (first, mut rest) =
                    petrel_wire::read_string(inner).change_context(Error::BadPlan)?;
                let mut path = PathExpr::new(first);
                while !rest.is_empty() {
                    let (part, r) =
                        petrel_wire::read_string(rest).change_context(Error::BadPlan)?;
                    path.rest.push(part.to_owned());
                    rest = r;
                }
                inner = rest;
                Expr::Path(path)
            }
            "str" => {
                let (s, rest) = petrel_wire::read_string(inner).change_context(Error::BadPlan)?;
                inner = rest;
                Expr::String(s.to_owned())
            }
            "int" => {
                let (v, rest) = petrel_wire::read_int(inner).change_context(Error::BadPlan)?;
                inner = rest;
                Expr::Int(v)
            }
            "ts" => {
                let (v, rest) =
                    petrel_wire::read_timestamp(inner).change_context(Error::BadPlan)?;
                inner = rest;
                Expr::Timestamp(v)
            }
            "bool" => {
                let (v, rest) = petrel_wire::read_bool(inner).change_context(Error::BadPlan)?;
                inner = rest;
                Expr::Bool(v)
            }
            "cmp" => {
                let (op_sym, rest) =
                    petrel_wire::read_symbol(inner).change_context(Error::BadPlan)?;
                let op = st
                    .name(op_sym)
                    .and_then(CmpOp::from_symbol)
                    .ok_or_else(|| report!(Error::BadPlan))?;
                let (lhs, rest) = Expr::decode_nested(st, rest)?;
                let (rhs, rest) = Expr::decode_nested(st, rest)?;
                inner = rest;
                Expr::compare(op, lhs, rhs)
            }
            "and" | "or" => {
                let (lhs, rest) = Expr::decode_nested(st, inner)?;
                let (rhs, rest) = Expr::decode_nested(st, rest)?;
                inner = rest;
                if kind == "and" {
                    Expr::and(lhs, rhs)
                } else {
                    Expr::or(lhs, rhs)
                }
            }
            _ => return Err(report!(Error::BadPlan).attach_printable(kind)),
        };
        petrel_wire::expect_consumed(inner).change_context(Error::BadPlan)?;
        Ok((expr, &body[total..]))
    }

    fn decode_nested<'a>(
        st: &Symtab,
        body: &'a [u8],
    ) -> error_stack::Result<(Self, &'a [u8]), Error> {
        if petrel_wire::type_of(body).change_context(Error::BadPlan)? != Type::List {
            return Err(report!(Error::BadPlan).attach_printable("expression must be a list"));
        }
        Self::decode(st, body)
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Path(p) => write!(f, "{p}"),
            Expr::String(s) => write!(f, "{s:?}"),
            Expr::Int(v) => write!(f, "{v}"),
            Expr::Timestamp(ts) => write!(f, "`{}`", ts.to_rfc3339()),
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Compare(op, lhs, rhs) => write!(f, "{lhs} {} {rhs}", op.symbol()),
            Expr::And(lhs, rhs) => write!(f, "({lhs} AND {rhs})"),
            Expr::Or(lhs, rhs) => write!(f, "({lhs} OR {rhs})"),
        }
    }
}
