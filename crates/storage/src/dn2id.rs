//! Name→ID index: normalized DN → entry ID, plus the reverse
//! parent-ID → child-ID-set edge, grounded in back-bdb's `dn2id`/`id2children`
//! databases (`bdb_dn2id_add`, `bdb_dn2id_delete`).

use dirstore_core::EntryId;

use crate::kv::{KvError, Transaction};

/// `dn2id` table name.
pub const DN2ID_TABLE: &str = "dn2id";
/// `id2children` table name.
pub const ID2CHILDREN_TABLE: &str = "id2children";

/// Failures specific to name-index mutation, layered over [`KvError`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DnIndexError {
    /// Underlying KV failure (deadlock, not-granted, key-exists, not-found).
    #[error(transparent)]
    Kv(#[from] KvError),
    /// Delete attempted against an entry that still has children.
    #[error("entry has children")]
    HasChildren,
}

fn encode_children(ids: &[EntryId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ids.len() * 4);
    for id in ids {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf
}

fn decode_children(bytes: &[u8]) -> Vec<EntryId> {
    bytes
        .chunks_exact(4)
        .map(|c| EntryId::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Stateless operations over the name→ID index; every call runs inside the
/// caller's transaction so it composes with the fixed-order index update
/// protocol.
pub struct NameIndex;

impl NameIndex {
    /// Look up a normalized DN's entry ID.
    pub fn lookup(txn: &mut Transaction, normalized_dn: &str) -> Result<Option<EntryId>, KvError> {
        let bytes = txn.get(DN2ID_TABLE, normalized_dn.as_bytes())?;
        Ok(bytes.map(|b| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&b);
            EntryId::from_be_bytes(buf)
        }))
    }

    /// Read the child-ID set for a parent.
    pub fn children(txn: &mut Transaction, parent: EntryId) -> Result<Vec<EntryId>, KvError> {
        let bytes = txn.get(ID2CHILDREN_TABLE, &parent.to_be_bytes())?;
        Ok(bytes.map(|b| decode_children(&b)).unwrap_or_default())
    }

    /// Add a DN→ID edge and link it under its parent's child set. Fails
    /// with [`KvError::KeyExists`] if the DN already resolves.
    pub fn add(
        txn: &mut Transaction,
        normalized_dn: &str,
        id: EntryId,
        parent: Option<EntryId>,
    ) -> Result<(), KvError> {
        txn.put_new(DN2ID_TABLE, normalized_dn.as_bytes(), id.to_be_bytes().to_vec())?;
        if let Some(parent_id) = parent {
            let mut children = Self::children(txn, parent_id)?;
            children.push(id);
            txn.put(ID2CHILDREN_TABLE, &parent_id.to_be_bytes(), encode_children(&children))?;
        }
        Ok(())
    }

    /// Remove a DN→ID edge and unlink it from its parent's child set.
    /// Fails with [`DnIndexError::HasChildren`] if the entry still has
    /// children of its own.
    pub fn delete(
        txn: &mut Transaction,
        normalized_dn: &str,
        id: EntryId,
        parent: Option<EntryId>,
    ) -> Result<(), DnIndexError> {
        if !Self::children(txn, id)?.is_empty() {
            return Err(DnIndexError::HasChildren);
        }
        txn.del(DN2ID_TABLE, normalized_dn.as_bytes())?;
        if let Some(parent_id) = parent {
            let mut children = Self::children(txn, parent_id)?;
            children.retain(|c| *c != id);
            txn.put(ID2CHILDREN_TABLE, &parent_id.to_be_bytes(), encode_children(&children))?;
        }
        Ok(())
    }

    /// Re-parent a DN→ID edge (modrdn), moving the ID from `old_parent`'s
    /// child set to `new_parent`'s and rewriting the DN key.
    pub fn rename(
        txn: &mut Transaction,
        old_normalized_dn: &str,
        new_normalized_dn: &str,
        id: EntryId,
        old_parent: Option<EntryId>,
        new_parent: Option<EntryId>,
    ) -> Result<(), KvError> {
        txn.del(DN2ID_TABLE, old_normalized_dn.as_bytes())?;
        txn.put_new(DN2ID_TABLE, new_normalized_dn.as_bytes(), id.to_be_bytes().to_vec())?;
        if old_parent != new_parent {
            if let Some(pid) = old_parent {
                let mut children = Self::children(txn, pid)?;
                children.retain(|c| *c != id);
                txn.put(ID2CHILDREN_TABLE, &pid.to_be_bytes(), encode_children(&children))?;
            }
            if let Some(pid) = new_parent {
                let mut children = Self::children(txn, pid)?;
                children.push(id);
                txn.put(ID2CHILDREN_TABLE, &pid.to_be_bytes(), encode_children(&children))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvEngine;
    use std::time::Duration;

    fn engine() -> KvEngine {
        KvEngine::new(Duration::from_millis(200))
    }

    #[test]
    fn add_then_lookup_round_trips() {
        let e = engine();
        let mut t = e.begin();
        NameIndex::add(&mut t, "dc=com", EntryId(1), None).unwrap();
        assert_eq!(NameIndex::lookup(&mut t, "dc=com").unwrap(), Some(EntryId(1)));
        t.commit().unwrap();
    }

    #[test]
    fn add_duplicate_dn_fails_key_exists() {
        let e = engine();
        let mut t = e.begin();
        NameIndex::add(&mut t, "dc=com", EntryId(1), None).unwrap();
        let err = NameIndex::add(&mut t, "dc=com", EntryId(2), None).unwrap_err();
        assert_eq!(err, KvError::KeyExists);
        t.commit().unwrap();
    }

    #[test]
    fn children_tracked_on_parent() {
        let e = engine();
        let mut t = e.begin();
        NameIndex::add(&mut t, "dc=com", EntryId(1), None).unwrap();
        NameIndex::add(&mut t, "dc=example,dc=com", EntryId(2), Some(EntryId(1))).unwrap();
        assert_eq!(NameIndex::children(&mut t, EntryId(1)).unwrap(), vec![EntryId(2)]);
        t.commit().unwrap();
    }

    #[test]
    fn delete_fails_when_children_present() {
        let e = engine();
        let mut t = e.begin();
        NameIndex::add(&mut t, "dc=com", EntryId(1), None).unwrap();
        NameIndex::add(&mut t, "dc=example,dc=com", EntryId(2), Some(EntryId(1))).unwrap();
        let err = NameIndex::delete(&mut t, "dc=com", EntryId(1), None).unwrap_err();
        assert_eq!(err, DnIndexError::HasChildren);
        t.commit().unwrap();
    }

    #[test]
    fn rename_moves_between_parents() {
        let e = engine();
        let mut t = e.begin();
        NameIndex::add(&mut t, "dc=com", EntryId(1), None).unwrap();
        NameIndex::add(&mut t, "ou=a,dc=com", EntryId(2), Some(EntryId(1))).unwrap();
        NameIndex::add(&mut t, "ou=b,dc=com", EntryId(3), Some(EntryId(1))).unwrap();
        NameIndex::add(&mut t, "cn=x,ou=a,dc=com", EntryId(4), Some(EntryId(2))).unwrap();

        NameIndex::rename(
            &mut t,
            "cn=x,ou=a,dc=com",
            "cn=x,ou=b,dc=com",
            EntryId(4),
            Some(EntryId(2)),
            Some(EntryId(3)),
        )
        .unwrap();

        assert_eq!(NameIndex::children(&mut t, EntryId(2)).unwrap(), Vec::<EntryId>::new());
        assert_eq!(NameIndex::children(&mut t, EntryId(3)).unwrap(), vec![EntryId(4)]);
        assert_eq!(NameIndex::lookup(&mut t, "cn=x,ou=b,dc=com").unwrap(), Some(EntryId(4)));
        t.commit().unwrap();
    }
}
