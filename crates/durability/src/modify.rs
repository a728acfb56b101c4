//! In-memory application of one modify mod-list entry: each entry is an
//! `{op, attribute, values}` triple with `op` one of add, delete, replace,
//! increment, or soft-add. Grounded in back-bdb's `bdb_modify_internal`
//! per-mod dispatch switch.
//!
//! Lives alongside [`crate::changelog::ModSpec`]/[`crate::changelog::ModOp`]
//! rather than in either backend crate because both the transactional
//! orchestrator and the filesystem backend need the identical in-memory
//! mutation before going on to their own durability step (index
//! maintenance vs. whole-file rewrite).

use dirstore_core::{AttributeValues, DirError, Entry};

use crate::changelog::{ModOp, ModSpec};

/// Apply one mod-list entry to `entry` in place.
pub fn apply_mod(entry: &mut Entry, spec: &ModSpec) -> Result<(), DirError> {
    let attr = spec.attribute.as_str();
    match spec.op {
        ModOp::Add => {
            let existing = entry.get_attr(attr).map(|v| v.0.clone()).unwrap_or_default();
            for v in &spec.values {
                if existing.contains(v) {
                    return Err(DirError::TypeOrValueExists);
                }
            }
            entry.add_values(attr, spec.values.clone());
        }
        ModOp::Delete => {
            if spec.values.is_empty() {
                if !entry.remove_attr(attr) {
                    return Err(DirError::UnwillingToPerform(format!(
                        "attribute {attr} not present"
                    )));
                }
            } else {
                let existing = entry
                    .get_attr(attr)
                    .map(|v| v.0.clone())
                    .ok_or_else(|| {
                        DirError::UnwillingToPerform(format!("attribute {attr} not present"))
                    })?;
                for v in &spec.values {
                    if !existing.contains(v) {
                        return Err(DirError::UnwillingToPerform(format!(
                            "value not present on {attr}"
                        )));
                    }
                }
                let remaining: Vec<Vec<u8>> =
                    existing.into_iter().filter(|v| !spec.values.contains(v)).collect();
                if remaining.is_empty() {
                    entry.remove_attr(attr);
                } else {
                    entry.set_attr(attr, AttributeValues(remaining));
                }
            }
        }
        ModOp::Replace => {
            if spec.values.is_empty() {
                entry.remove_attr(attr);
            } else {
                entry.set_attr(attr, AttributeValues(spec.values.clone()));
            }
        }
        ModOp::Increment => {
            let existing = entry.get_attr(attr).and_then(|v| v.0.first()).ok_or_else(|| {
                DirError::UnwillingToPerform(format!("attribute {attr} not present"))
            })?;
            let current: i64 = std::str::from_utf8(existing)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| DirError::UnwillingToPerform(format!("{attr} is not numeric")))?;
            let delta: i64 = spec
                .values
                .first()
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    DirError::UnwillingToPerform("increment delta is not numeric".into())
                })?;
            let updated = current
                .checked_add(delta)
                .ok_or_else(|| DirError::UnwillingToPerform("increment overflow".into()))?;
            entry.set_attr(attr, AttributeValues::single(updated.to_string()));
        }
        ModOp::SoftAdd => {
            let existing = entry.get_attr(attr).map(|v| v.0.clone()).unwrap_or_default();
            let fresh: Vec<Vec<u8>> =
                spec.values.iter().filter(|v| !existing.contains(v)).cloned().collect();
            if !fresh.is_empty() {
                entry.add_values(attr, fresh);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_core::{Dn, EntryId};

    fn entry() -> Entry {
        let dn = Dn::parse("cn=alice,dc=example,dc=com").unwrap();
        let mut e = Entry::new(EntryId(1), dn);
        e.set_attr("cn", AttributeValues::single("alice"));
        e.set_attr("roomNumber", AttributeValues::single("100"));
        e
    }

    #[test]
    fn add_rejects_duplicate_value() {
        let mut e = entry();
        let spec = ModSpec { op: ModOp::Add, attribute: "cn".into(), values: vec![b"alice".to_vec()] };
        let err = apply_mod(&mut e, &spec).unwrap_err();
        assert!(matches!(err, DirError::TypeOrValueExists));
    }

    #[test]
    fn add_appends_new_value() {
        let mut e = entry();
        let spec = ModSpec { op: ModOp::Add, attribute: "cn".into(), values: vec![b"ally".to_vec()] };
        apply_mod(&mut e, &spec).unwrap();
        assert_eq!(e.get_attr("cn").unwrap().0.len(), 2);
    }

    #[test]
    fn delete_whole_attribute_when_values_empty() {
        let mut e = entry();
        let spec = ModSpec { op: ModOp::Delete, attribute: "roomNumber".into(), values: vec![] };
        apply_mod(&mut e, &spec).unwrap();
        assert!(e.get_attr("roomNumber").is_none());
    }

    #[test]
    fn delete_missing_attribute_fails() {
        let mut e = entry();
        let spec = ModSpec { op: ModOp::Delete, attribute: "fax".into(), values: vec![] };
        let err = apply_mod(&mut e, &spec).unwrap_err();
        assert!(matches!(err, DirError::UnwillingToPerform(_)));
    }

    #[test]
    fn replace_with_empty_removes_attribute() {
        let mut e = entry();
        let spec = ModSpec { op: ModOp::Replace, attribute: "cn".into(), values: vec![] };
        apply_mod(&mut e, &spec).unwrap();
        assert!(e.get_attr("cn").is_none());
    }

    #[test]
    fn increment_adds_delta_to_numeric_value() {
        let mut e = entry();
        let spec =
            ModSpec { op: ModOp::Increment, attribute: "roomNumber".into(), values: vec![b"5".to_vec()] };
        apply_mod(&mut e, &spec).unwrap();
        assert_eq!(e.get_attr("roomNumber").unwrap().0[0], b"105");
    }

    #[test]
    fn increment_on_non_numeric_fails() {
        let mut e = entry();
        let spec =
            ModSpec { op: ModOp::Increment, attribute: "cn".into(), values: vec![b"1".to_vec()] };
        let err = apply_mod(&mut e, &spec).unwrap_err();
        assert!(matches!(err, DirError::UnwillingToPerform(_)));
    }

    #[test]
    fn soft_add_skips_existing_without_error() {
        let mut e = entry();
        let spec = ModSpec {
            op: ModOp::SoftAdd,
            attribute: "cn".into(),
            values: vec![b"alice".to_vec(), b"ally".to_vec()],
        };
        apply_mod(&mut e, &spec).unwrap();
        assert_eq!(e.get_attr("cn").unwrap().0.len(), 2);
    }
}
