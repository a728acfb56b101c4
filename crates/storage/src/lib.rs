//! Embedded KV transaction substrate and the three indexes that sit on
//! top of it: name→ID, attribute, and ID→entry.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dn2id; // name->ID index
pub mod id2entry; // ID->entry store
pub mod idalloc; // ID allocator
pub mod index; // attribute index
pub mod kv; // KV transaction substrate

pub use dn2id::{DnIndexError, NameIndex, DN2ID_TABLE, ID2CHILDREN_TABLE};
pub use id2entry::{EntryStore, ID2ENTRY_TABLE};
pub use idalloc::{IdAllocError, IdAllocator};
pub use index::{AttributeIndex, Tokenizer};
pub use kv::{KvEngine, KvError, Locker, NestedUndo, Transaction};
