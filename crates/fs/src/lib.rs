//! Filesystem backend: file-per-entry, directory-per-subtree
//! storage with atomic writes, referral-on-miss lookup, and scoped
//! search traversal.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod atomic;
pub mod backend;
mod path;
pub mod tool;

pub use backend::{FsBackend, Lookup};
pub use dirstore_core::Scope;
pub use tool::ToolSession;
