//! Re-exported from [`dirstore_durability::csn`]: both backends stamp
//! `entryCSN`/`modifyTimestamp` identically, so the generator lives once
//! in the crate both already depend on.

pub use dirstore_durability::CsnGenerator;
