//! Data model and cross-cutting primitives for the directory storage
//! core: distinguished names, the entry model and its LDIF-style
//! serialization, the name codec, error taxonomy, and configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth; // bind-time password verification seam
pub mod codec; // name codec (DN component <-> filesystem path segment)
pub mod config; // backend configuration builder
pub mod dn; // DN / RDN types
pub mod entry; // entry model + LDIF serialization
pub mod error; // unified error taxonomy
pub mod scope; // search scope shared by both backends

pub use auth::{PasswordVerifier, PlaintextVerifier};
pub use codec::{decode_segment, dn_to_container_path, dn_to_path, encode_rdn, Platform};
pub use config::{BackendConfig, BackendConfigBuilder, CheckpointPolicy, IndexConfig, IndexKind, ReplicaConfig};
pub use dn::{Dn, Rdn};
pub use scope::Scope;
pub use entry::{
    entry_to_full_ldif, entry_to_ldif, parse_full_ldif, parse_ldif, AttributeValues, Entry,
    EntryId, LdifParseError, ObjectClassFlags,
};
pub use error::{DirError, Result};
