// merkle-rs/src/lib.rs
//
// Binary Merkle trees over record-version chains.
//
// Node algebra operates on lowercase hex digest strings: a leaf is the
// SHA-256 of its input item, and an internal node is the SHA-256 of the
// string concatenation of its children's hex digests. Odd levels duplicate
// their last node. Inclusion proofs carry directional siblings ("L:"/"R:");
// an undirected legacy form (bare hex, treated as left) is accepted on input.

use shared_types::{sha256_hex, VersionEntry};

/// Errors produced by proof parsing and chain verification.
#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    #[error("invalid proof format: {0}")]
    InvalidProofFormat(String),

    #[error("root mismatch: computed {computed}, expected {expected}")]
    RootMismatch { computed: String, expected: String },

    #[error("version chain broken at index {index}: {reason}")]
    ChainBroken { index: usize, reason: String },
}

impl From<MerkleError> for shared_types::CustodyError {
    fn from(e: MerkleError) -> Self {
        shared_types::CustodyError::with_source(
            shared_types::ErrorKind::IntegrityViolation,
            e.to_string(),
            e,
        )
    }
}

/// One step of an inclusion proof: the sibling digest and which side of the
/// current node it sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: String,
    pub sibling_is_left: bool,
}

impl ProofStep {
    /// Serialized form, always directional.
    pub fn encode(&self) -> String {
        if self.sibling_is_left {
            format!("L:{}", self.sibling)
        } else {
            format!("R:{}", self.sibling)
        }
    }

    /// Parse a directional step, or an undirected legacy step which is
    /// treated as a left-hand sibling.
    pub fn parse(raw: &str) -> Result<Self, MerkleError> {
        let (side, digest) = match raw.split_once(':') {
            Some(("L", d)) => (true, d),
            Some(("R", d)) => (false, d),
            Some((other, _)) => {
                return Err(MerkleError::InvalidProofFormat(format!(
                    "unknown direction {other:?}"
                )))
            }
            None => (true, raw),
        };
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(MerkleError::InvalidProofFormat(format!(
                "sibling is not a hex digest: {digest:?}"
            )));
        }
        Ok(Self {
            sibling: digest.to_ascii_lowercase(),
            sibling_is_left: side,
        })
    }
}

/// A fully materialized Merkle tree. Level 0 holds the leaves; the last
/// level holds the single root.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    /// Build a tree over the given items in submitted order. Each leaf is
    /// `SHA256(item)`. Returns `None` for an empty input.
    pub fn build<I, T>(items: I) -> Option<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let leaves: Vec<String> = items
            .into_iter()
            .map(|item| sha256_hex(item.as_ref()))
            .collect();
        Self::from_leaves(leaves)
    }

    /// Build a tree whose leaves are the given digests, unhashed.
    pub fn from_leaves(leaves: Vec<String>) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }
        let mut levels = vec![leaves];
        while levels.last().unwrap().len() > 1 {
            let current = levels.last().unwrap();
            let mut next = Vec::with_capacity((current.len() + 1) / 2);
            let mut i = 0;
            while i < current.len() {
                let left = &current[i];
                // Odd level size duplicates the last node.
                let right = current.get(i + 1).unwrap_or(left);
                next.push(hash_pair(left, right));
                i += 2;
            }
            levels.push(next);
        }
        Some(Self { levels })
    }

    pub fn root(&self) -> &str {
        &self.levels.last().unwrap()[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Inclusion proof for the leaf at `index`: ordered directional siblings
    /// from leaf level to just below the root.
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut steps = Vec::new();
        let mut i = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = if i % 2 == 0 { i + 1 } else { i - 1 };
            // A missing right sibling means this node was duplicated.
            let sibling = level.get(sibling_index).unwrap_or(&level[i]);
            steps.push(ProofStep {
                sibling: sibling.clone(),
                sibling_is_left: i % 2 == 1,
            });
            i /= 2;
        }
        Some(steps)
    }

    /// Inclusion proof for the first leaf equal to `leaf_hash`.
    pub fn proof_for_leaf(&self, leaf_hash: &str) -> Option<Vec<ProofStep>> {
        let index = self.levels[0].iter().position(|l| l == leaf_hash)?;
        self.proof(index)
    }
}

fn hash_pair(left: &str, right: &str) -> String {
    let mut joined = String::with_capacity(left.len() + right.len());
    joined.push_str(left);
    joined.push_str(right);
    sha256_hex(joined.as_bytes())
}

/// Directional proof verification, the authoritative variant.
///
/// Malformed steps are an error; a well-formed proof that does not chain to
/// `root` returns `Ok(false)`.
pub fn verify_proof(root: &str, leaf_hash: &str, proof: &[String]) -> Result<bool, MerkleError> {
    let mut h = leaf_hash.to_ascii_lowercase();
    for raw in proof {
        let step = ProofStep::parse(raw)?;
        h = if step.sibling_is_left {
            hash_pair(&step.sibling, &h)
        } else {
            hash_pair(&h, &step.sibling)
        };
    }
    Ok(h == root.to_ascii_lowercase())
}

/// Typed variant used when the proof was produced in-process.
pub fn verify_proof_steps(root: &str, leaf_hash: &str, proof: &[ProofStep]) -> bool {
    let encoded: Vec<String> = proof.iter().map(ProofStep::encode).collect();
    verify_proof(root, leaf_hash, &encoded).unwrap_or(false)
}

/// Merkle root over a record's ordered version entries.
pub fn version_chain_root(versions: &[VersionEntry]) -> Option<String> {
    MerkleTree::build(versions.iter().map(|v| v.hash.as_bytes())).map(|t| t.root().to_string())
}

/// Verify an ordered version chain.
///
/// Each entry's `previous_hash` must equal the prior entry's `hash` (empty
/// for the first), and each entry's `hash` must recompute from its canonical
/// serialization. Versions must ascend from 1.
pub fn verify_version_chain(versions: &[VersionEntry]) -> Result<(), MerkleError> {
    let mut expected_prev = String::new();
    for (index, entry) in versions.iter().enumerate() {
        if entry.version != (index as u64) + 1 {
            return Err(MerkleError::ChainBroken {
                index,
                reason: format!("expected version {}, found {}", index + 1, entry.version),
            });
        }
        if entry.previous_hash != expected_prev {
            return Err(MerkleError::ChainBroken {
                index,
                reason: "previous_hash does not match prior entry".to_string(),
            });
        }
        let recomputed = entry.compute_hash();
        if recomputed != entry.hash {
            return Err(MerkleError::ChainBroken {
                index,
                reason: "entry hash does not recompute".to_string(),
            });
        }
        expected_prev = entry.hash.clone();
    }
    Ok(())
}

/// Convenience predicate over [`verify_version_chain`].
pub fn chain_is_valid(versions: &[VersionEntry]) -> bool {
    verify_version_chain(versions).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn single_leaf_root_is_item_hash() {
        let tree = MerkleTree::build(["a"]).unwrap();
        assert_eq!(tree.root(), sha256_hex(b"a"));
        assert_eq!(
            tree.root(),
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
    }

    #[test]
    fn proof_roundtrip_four_leaves() {
        let tree = MerkleTree::build(["a", "b", "c", "d"]).unwrap();
        let leaf_c = sha256_hex(b"c");
        let proof = tree.proof_for_leaf(&leaf_c).unwrap();
        assert_eq!(proof.len(), 2);
        assert!(verify_proof_steps(tree.root(), &leaf_c, &proof));
    }

    #[test]
    fn tampered_proof_fails() {
        let tree = MerkleTree::build(["a", "b", "c", "d"]).unwrap();
        let leaf_c = sha256_hex(b"c");
        let mut encoded: Vec<String> = tree
            .proof_for_leaf(&leaf_c)
            .unwrap()
            .iter()
            .map(ProofStep::encode)
            .collect();
        // Flip one hex digit of the first sibling.
        let mut bytes = encoded[0].clone().into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'0' { b'1' } else { b'0' };
        encoded[0] = String::from_utf8(bytes).unwrap();
        assert!(!verify_proof(tree.root(), &leaf_c, &encoded).unwrap());
    }

    #[test]
    fn odd_leaf_count_duplicates_last() {
        let tree = MerkleTree::build(["a", "b", "c"]).unwrap();
        // Level 1 pairs (a,b) and (c,c).
        let leaf_c = sha256_hex(b"c");
        let expected = hash_pair(&hash_pair(&sha256_hex(b"a"), &sha256_hex(b"b")),
                                 &hash_pair(&leaf_c, &leaf_c));
        assert_eq!(tree.root(), expected);
        let proof = tree.proof_for_leaf(&leaf_c).unwrap();
        assert!(verify_proof_steps(tree.root(), &leaf_c, &proof));
    }

    #[test]
    fn every_leaf_proves_against_root() {
        let items = ["v1", "v2", "v3", "v4", "v5", "v6", "v7"];
        let tree = MerkleTree::build(items).unwrap();
        for (i, item) in items.iter().enumerate() {
            let leaf = sha256_hex(item.as_bytes());
            let proof = tree.proof(i).unwrap();
            assert!(verify_proof_steps(tree.root(), &leaf, &proof), "leaf {i}");
        }
    }

    #[test]
    fn undirected_proof_is_treated_as_left() {
        // Two leaves: proving the right leaf yields a left sibling, which is
        // exactly what the legacy undirected form encodes.
        let tree = MerkleTree::build(["x", "y"]).unwrap();
        let leaf_y = sha256_hex(b"y");
        let undirected = vec![sha256_hex(b"x")];
        assert!(verify_proof(tree.root(), &leaf_y, &undirected).unwrap());
    }

    #[test]
    fn malformed_step_is_rejected() {
        let err = verify_proof("00", "11", &["Q:zz".to_string()]).unwrap_err();
        assert!(matches!(err, MerkleError::InvalidProofFormat(_)));
        let err = verify_proof("00", "11", &["L:nothex".to_string()]).unwrap_err();
        assert!(matches!(err, MerkleError::InvalidProofFormat(_)));
    }

    fn chain_of(n: u64) -> Vec<VersionEntry> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut out: Vec<VersionEntry> = Vec::new();
        for v in 1..=n {
            let prev = out.last().map(|e| e.hash.clone()).unwrap_or_default();
            out.push(VersionEntry::seal(
                v,
                format!("Qm{v}"),
                "d1",
                base + chrono::Duration::minutes(v as i64),
                prev,
            ));
        }
        out
    }

    #[test]
    fn version_chain_verifies() {
        let chain = chain_of(2);
        assert!(chain_is_valid(&chain));
    }

    #[test]
    fn corrupted_previous_hash_breaks_chain() {
        let mut chain = chain_of(2);
        chain[1].previous_hash = "deadbeef".to_string();
        let err = verify_version_chain(&chain).unwrap_err();
        assert!(matches!(err, MerkleError::ChainBroken { index: 1, .. }));
    }

    #[test]
    fn corrupted_cid_breaks_recompute() {
        let mut chain = chain_of(3);
        chain[2].cid = "QmTampered".to_string();
        assert!(!chain_is_valid(&chain));
    }

    #[test]
    fn chain_root_matches_tree_over_hashes() {
        let chain = chain_of(3);
        let root = version_chain_root(&chain).unwrap();
        let tree = MerkleTree::build(chain.iter().map(|v| v.hash.as_bytes())).unwrap();
        assert_eq!(root, tree.root());
    }
}
