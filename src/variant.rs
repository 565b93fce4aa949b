//! Deterministic A/B variant assignment.
//!
//! A contact always lands in the same variant of a given node: the choice is
//! a weighted bucket over a SHA-256 digest of `(contact_email, node_id)`,
//! which is stable across processes and releases.

use ring::digest::{digest, SHA256};

use crate::automation::Variant;

/// Pick a variant for `contact_email` at `node_id`.
///
/// Weights are arbitrary positive integers. Variants are walked in their
/// declared order. Returns `None` when there is nothing to choose from.
pub fn select<'a>(contact_email: &str, node_id: &str, variants: &'a [Variant]) -> Option<&'a Variant> {
    let total: u64 = variants.iter().map(|v| u64::from(v.weight)).sum();
    if total == 0 {
        return None;
    }

    let bucket = stable_hash(contact_email, node_id) % total;
    let mut upper = 0u64;
    for variant in variants {
        upper += u64::from(variant.weight);
        if bucket < upper {
            return Some(variant);
        }
    }
    None
}

fn stable_hash(contact_email: &str, node_id: &str) -> u64 {
    let mut input = Vec::with_capacity(contact_email.len() + node_id.len() + 1);
    input.extend_from_slice(contact_email.as_bytes());
    // Separator keeps ("ab","c") and ("a","bc") apart.
    input.push(0);
    input.extend_from_slice(node_id.as_bytes());

    let hash = digest(&SHA256, &input);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_ref()[..8]);
    u64::from_be_bytes(prefix)
}
