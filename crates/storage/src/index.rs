//! Attribute index: reverse mapping (attribute, token) → entry-ID
//! set, grounded in back-bdb's `index_entry_add`/`index_entry_del` and
//! strata-search's tokenizer shape (exact / substring n-gram / approximate
//! strategies).

use std::collections::BTreeSet;

use dirstore_core::EntryId;

use crate::kv::{KvError, Transaction};

/// Which tokenization strategy an indexed attribute uses, matching spec
/// §6's `index attr flags` configuration (`eq|sub|pres|approx`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tokenizer {
    /// Whole normalized value is one token (equality index).
    Exact,
    /// Overlapping n-grams of the normalized value (substring index).
    SubstringNgram {
        /// N-gram width.
        n: usize,
    },
    /// A coarse phonetic-ish fold for "sounds like" matching.
    Approximate,
}

const NGRAM_DEFAULT: usize = 3;

impl Default for Tokenizer {
    fn default() -> Self {
        Tokenizer::SubstringNgram { n: NGRAM_DEFAULT }
    }
}

/// Split a normalized attribute value into index tokens per `strategy`.
pub fn tokenize(strategy: Tokenizer, normalized_value: &str) -> Vec<String> {
    match strategy {
        Tokenizer::Exact => vec![normalized_value.to_string()],
        Tokenizer::SubstringNgram { n } => {
            let chars: Vec<char> = normalized_value.chars().collect();
            if chars.len() < n {
                return vec![normalized_value.to_string()];
            }
            chars.windows(n).map(|w| w.iter().collect()).collect()
        }
        Tokenizer::Approximate => vec![soundex_fold(normalized_value)],
    }
}

/// A coarse approximate-match fold: collapses runs of vowels and doubled
/// consonants, discarding case and whitespace. Not a full Soundex
/// implementation — just a stable bucketing function sufficient for
/// "approximate" match semantics.
fn soundex_fold(value: &str) -> String {
    let mut out = String::new();
    let mut last: Option<char> = None;
    for c in value.chars().filter(|c| c.is_alphanumeric()) {
        let c = c.to_ascii_lowercase();
        if matches!(c, 'a' | 'e' | 'i' | 'o' | 'u') {
            continue;
        }
        if last == Some(c) {
            continue;
        }
        out.push(c);
        last = Some(c);
    }
    out
}

fn table_name(attribute: &str) -> String {
    format!("idx_{}", attribute.to_ascii_lowercase())
}

fn encode_id_set(ids: &BTreeSet<EntryId>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ids.len() * 4);
    for id in ids {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf
}

fn decode_id_set(bytes: &[u8]) -> BTreeSet<EntryId> {
    bytes
        .chunks_exact(4)
        .map(|c| EntryId::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Stateless operations over one attribute's reverse index.
pub struct AttributeIndex;

impl AttributeIndex {
    /// Look up the ID set for a single token.
    pub fn lookup(
        txn: &mut Transaction,
        attribute: &str,
        token: &str,
    ) -> Result<BTreeSet<EntryId>, KvError> {
        let table = table_name(attribute);
        let bytes = txn.get(&table, token.as_bytes())?;
        Ok(bytes.map(|b| decode_id_set(&b)).unwrap_or_default())
    }

    /// Add `id` under every token derived from `normalized_value`.
    pub fn add_value(
        txn: &mut Transaction,
        attribute: &str,
        strategy: Tokenizer,
        normalized_value: &str,
        id: EntryId,
    ) -> Result<(), KvError> {
        let table = table_name(attribute);
        for token in tokenize(strategy, normalized_value) {
            let mut set = {
                let bytes = txn.get(&table, token.as_bytes())?;
                bytes.map(|b| decode_id_set(&b)).unwrap_or_default()
            };
            set.insert(id);
            txn.put(&table, token.as_bytes(), encode_id_set(&set))?;
        }
        Ok(())
    }

    /// Remove `id` from every token derived from `normalized_value`.
    pub fn remove_value(
        txn: &mut Transaction,
        attribute: &str,
        strategy: Tokenizer,
        normalized_value: &str,
        id: EntryId,
    ) -> Result<(), KvError> {
        let table = table_name(attribute);
        for token in tokenize(strategy, normalized_value) {
            let bytes = txn.get(&table, token.as_bytes())?;
            let Some(bytes) = bytes else { continue };
            let mut set = decode_id_set(&bytes);
            set.remove(&id);
            if set.is_empty() {
                txn.del(&table, token.as_bytes())?;
            } else {
                txn.put(&table, token.as_bytes(), encode_id_set(&set))?;
            }
        }
        Ok(())
    }

    /// Modify = delete-then-add per changed value.
    pub fn replace_value(
        txn: &mut Transaction,
        attribute: &str,
        strategy: Tokenizer,
        old_value: &str,
        new_value: &str,
        id: EntryId,
    ) -> Result<(), KvError> {
        Self::remove_value(txn, attribute, strategy, old_value, id)?;
        Self::add_value(txn, attribute, strategy, new_value, id)
    }
}
