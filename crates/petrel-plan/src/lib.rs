//! Query planning for the engine's front door.
//!
//! Given a parsed table reference, the [`Env`] resolves it against the
//! tenant's store (memoising index loads within the query and folding
//! each first resolution into a cache fingerprint), compiles `WHERE`
//! predicates into block-level pushdown, and hands the resulting table
//! handle to the [`Splitter`], which shards the handle's blobs across
//! peer workers deterministically and encodes the per-peer plan subtree
//! for shipment.

#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

mod env;
mod expr;
mod filter;
mod handle;
mod split;
mod transport;

pub use env::Env;
pub use expr::{CmpOp, Expr, PathExpr};
pub use filter::{compile, CompiledFilter, Decision};
pub use handle::{FilterHandle, TableHandle};
pub use split::{
    default_handle_fn, HandleFn, Split, Splitter, Subtable, Subtables, DEFAULT_SPLIT_SIZE,
};
pub use transport::Transport;

#[derive(derive_more::Display, Debug)]
pub enum Error {
    /// A malformed table reference; the message cites the offending
    /// fragment.
    #[display(fmt = "{_0}")]
    Syntax(String),
    #[display(fmt = "storage error")]
    Storage,
    #[display(fmt = "cannot split a table handle of this type")]
    HandleType,
    #[display(fmt = "cannot split work across an empty peer list")]
    NoPeers,
    #[display(fmt = "invalid plan encoding")]
    BadPlan,
    #[display(fmt = "internal error")]
    Internal,
}

impl error_stack::Context for Error {}

pub(crate) fn syntax(msg: String) -> error_stack::Report<Error> {
    error_stack::report!(Error::Syntax(msg))
}
