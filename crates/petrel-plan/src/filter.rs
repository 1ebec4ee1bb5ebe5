use chrono::{DateTime, Utc};
use petrel_blockfmt::{FieldPath, SparseIndex};

use crate::expr::{CmpOp, Expr};

/// What the sparse index can say about one block for a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No row in the block can satisfy the predicate.
    Never,
    /// The block may hold matching rows.
    Maybe,
}

/// A predicate compiled against per-block min/max summaries.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter(Node);

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Cmp {
        path: FieldPath,
        op: CmpOp,
        ts: DateTime<Utc>,
    },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

/// Compile a `WHERE` expression into a block-level predicate.
///
/// Only shapes the sparse index can answer are compilable: comparisons
/// between a field path and a timestamp literal, conjunction, and
/// disjunction. Returns `None` when the expression (or a disjunct of it)
/// is outside that subset; the caller then keeps every block.
pub fn compile(e: &Expr) -> Option<CompiledFilter> {
    compile_node(e).map(CompiledFilter)
}

fn compile_node(e: &Expr) -> Option<Node> {
    match e {
        Expr::Compare(op, lhs, rhs) => match (lhs.as_ref(), rhs.as_ref()) {
            (Expr::Path(p), Expr::Timestamp(ts)) => Some(Node::Cmp {
                path: p.field_path(),
                op: *op,
                ts: *ts,
            }),
            (Expr::Timestamp(ts), Expr::Path(p)) => Some(Node::Cmp {
                path: p.field_path(),
                op: op.flipped(),
                ts: *ts,
            }),
            _ => None,
        },
        // A conjunct we cannot compile is simply not used; the other
        // side still eliminates blocks soundly.
        Expr::And(lhs, rhs) => match (compile_node(lhs), compile_node(rhs)) {
            (Some(l), Some(r)) => Some(Node::And(Box::new(l), Box::new(r))),
            (Some(l), None) => Some(l),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        },
        // A disjunct we cannot compile could match anywhere, so the
        // whole disjunction is uncompilable.
        Expr::Or(lhs, rhs) => {
            let l = compile_node(lhs)?;
            let r = compile_node(rhs)?;
            Some(Node::Or(Box::new(l), Box::new(r)))
        }
        _ => None,
    }
}

impl CompiledFilter {
    pub fn matches(&self, sparse: &SparseIndex, block: usize) -> Decision {
        eval(&self.0, sparse, block)
    }
}

fn eval(node: &Node, sparse: &SparseIndex, block: usize) -> Decision {
    match node {
        Node::Cmp { path, op, ts } => {
            let Some(range) = sparse.range(path, block) else {
                // No summary recorded for this block: cannot exclude it.
                return Decision::Maybe;
            };
            let never = match op {
                CmpOp::Lt => range.min >= *ts,
                CmpOp::Le => range.min > *ts,
                CmpOp::Eq => *ts < range.min || *ts > range.max,
                CmpOp::Ge => range.max < *ts,
                CmpOp::Gt => range.max <= *ts,
            };
            if never {
                Decision::Never
            } else {
                Decision::Maybe
            }
        }
        Node::And(lhs, rhs) => {
            if eval(lhs, sparse, block) == Decision::Never
                || eval(rhs, sparse, block) == Decision::Never
            {
                Decision::Never
            } else {
                Decision::Maybe
            }
        }
        Node::Or(lhs, rhs) => {
            if eval(lhs, sparse, block) == Decision::Never
                && eval(rhs, sparse, block) == Decision::Never
            {
                Decision::Never
            } else {
                Decision::Maybe
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use petrel_blockfmt::RangeSet;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// One-field sparse index with one block per given range.
    fn sparse(ranges: &[(i64, i64)]) -> SparseIndex {
        let mut out = SparseIndex::default();
        let path: FieldPath = vec!["ts".to_owned()];
        for (min, max) in ranges {
            let mut set = RangeSet::new();
            set.note(&path, ts(*min));
            set.note(&path, ts(*max));
            out.push_block(&set);
        }
        out
    }

    fn lt(secs: i64) -> Expr {
        Expr::compare(CmpOp::Lt, Expr::path(&["ts"]), Expr::Timestamp(ts(secs)))
    }

    #[test]
    fn test_comparison_eliminates_disjoint_blocks() {
        let sparse = sparse(&[(100, 200), (300, 400)]);
        let f = compile(&lt(50)).unwrap();
        assert_eq!(f.matches(&sparse, 0), Decision::Never);
        assert_eq!(f.matches(&sparse, 1), Decision::Never);

        let f = compile(&lt(150)).unwrap();
        assert_eq!(f.matches(&sparse, 0), Decision::Maybe);
        assert_eq!(f.matches(&sparse, 1), Decision::Never);
    }

    #[test]
    fn test_flipped_comparison() {
        // 150 > ts  is  ts < 150
        let e = Expr::compare(CmpOp::Gt, Expr::Timestamp(ts(150)), Expr::path(&["ts"]));
        let sparse = sparse(&[(100, 120), (200, 300)]);
        let f = compile(&e).unwrap();
        assert_eq!(f.matches(&sparse, 0), Decision::Maybe);
        assert_eq!(f.matches(&sparse, 1), Decision::Never);
    }

    #[test]
    fn test_eq_uses_both_bounds() {
        let sparse = sparse(&[(100, 200)]);
        let eq = |secs| {
            compile(&Expr::compare(
                CmpOp::Eq,
                Expr::path(&["ts"]),
                Expr::Timestamp(ts(secs)),
            ))
            .unwrap()
        };
        assert_eq!(eq(150).matches(&sparse, 0), Decision::Maybe);
        assert_eq!(eq(99).matches(&sparse, 0), Decision::Never);
        assert_eq!(eq(201).matches(&sparse, 0), Decision::Never);
    }

    #[test]
    fn test_unindexed_field_is_maybe() {
        let sparse = sparse(&[(100, 200)]);
        let e = Expr::compare(
            CmpOp::Lt,
            Expr::path(&["other"]),
            Expr::Timestamp(ts(50)),
        );
        let f = compile(&e).unwrap();
        assert_eq!(f.matches(&sparse, 0), Decision::Maybe);
    }

    #[test]
    fn test_and_keeps_compilable_side() {
        let e = Expr::and(
            lt(50),
            Expr::compare(CmpOp::Eq, Expr::path(&["name"]), Expr::String("x".into())),
        );
        let sparse = sparse(&[(100, 200)]);
        let f = compile(&e).unwrap();
        assert_eq!(f.matches(&sparse, 0), Decision::Never);
    }

    #[test]
    fn test_or_with_uncompilable_side_is_uncompilable() {
        let e = Expr::or(
            lt(50),
            Expr::compare(CmpOp::Eq, Expr::path(&["name"]), Expr::String("x".into())),
        );
        assert!(compile(&e).is_none());
    }

    #[test]
    fn test_or_eliminates_only_when_both_never() {
        let e = Expr::or(lt(50), lt(150));
        let sparse = sparse(&[(100, 200), (300, 400)]);
        let f = compile(&e).unwrap();
        assert_eq!(f.matches(&sparse, 0), Decision::Maybe);
        assert_eq!(f.matches(&sparse, 1), Decision::Never);
    }
}
