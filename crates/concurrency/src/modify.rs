//! Re-exported from [`dirstore_durability::modify`]: both the transactional
//! write orchestrator and the filesystem backend apply mod-list entries
//! identically, so the logic lives once in the crate both already depend
//! on for [`dirstore_durability::ModSpec`]/[`dirstore_durability::ModOp`].

pub use dirstore_durability::apply_mod;
