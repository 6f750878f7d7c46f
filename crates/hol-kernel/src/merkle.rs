//! Binary Merkle tree over delta hashes (RFC 6962 layout: leaves and interior
//! nodes are domain-separated and the left subtree is the largest power of two
//! smaller than the leaf count).

use hol_cbor::Hash;
use sha2::{Digest, Sha256};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn leaf_hash(leaf: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf.as_bytes());
    finish(hasher)
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    finish(hasher)
}

fn finish(hasher: Sha256) -> Hash {
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Hash::from(out)
}

/// Merkle root of `leaves` in order. The empty tree hashes to `SHA-256("")`.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => Hash::of_bytes(&[]),
        1 => leaf_hash(&leaves[0]),
        n => {
            let k = split_point(n);
            node_hash(&merkle_root(&leaves[..k]), &merkle_root(&leaves[k..]))
        }
    }
}

/// Sibling hashes from leaf `index` up to the root, bottom first.
pub fn inclusion_proof(leaves: &[Hash], index: usize) -> Option<Vec<Hash>> {
    if index >= leaves.len() {
        return None;
    }
    let mut path = Vec::new();
    collect_path(leaves, index, &mut path);
    Some(path)
}

fn collect_path(leaves: &[Hash], index: usize, path: &mut Vec<Hash>) {
    if leaves.len() <= 1 {
        return;
    }
    let k = split_point(leaves.len());
    if index < k {
        collect_path(&leaves[..k], index, path);
        path.push(merkle_root(&leaves[k..]));
    } else {
        collect_path(&leaves[k..], index - k, path);
        path.push(merkle_root(&leaves[..k]));
    }
}

/// Check an inclusion proof produced by [`inclusion_proof`] for a tree of `size` leaves.
pub fn verify_inclusion(leaf: &Hash, index: usize, size: usize, proof: &[Hash], root: &Hash) -> bool {
    if index >= size {
        return false;
    }
    // Rebuild the left/right decisions top-down, then fold bottom-up.
    let mut sides = Vec::new();
    let (mut n, mut idx) = (size, index);
    while n > 1 {
        let k = split_point(n);
        if idx < k {
            sides.push(false);
            n = k;
        } else {
            sides.push(true);
            idx -= k;
            n -= k;
        }
    }
    if sides.len() != proof.len() {
        return false;
    }
    let mut acc = leaf_hash(leaf);
    for (sibling, is_right) in proof.iter().zip(sides.iter().rev()) {
        acc = if *is_right {
            node_hash(sibling, &acc)
        } else {
            node_hash(&acc, sibling)
        };
    }
    acc == *root
}

fn split_point(n: usize) -> usize {
    debug_assert!(n > 1);
    let mut k = 1;
    while k << 1 < n {
        k <<= 1;
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n).map(|i| Hash::of_bytes(&(i as u64).to_le_bytes())).collect()
    }

    #[test]
    fn small_trees_match_manual_layout() {
        let l = leaves(3);
        let expected = node_hash(
            &node_hash(&leaf_hash(&l[0]), &leaf_hash(&l[1])),
            &leaf_hash(&l[2]),
        );
        assert_eq!(merkle_root(&l), expected);
        assert_eq!(merkle_root(&[]), Hash::of_bytes(&[]));
        assert_ne!(merkle_root(&l[..1]), l[0]);
    }

    #[test]
    fn root_depends_on_order() {
        let mut l = leaves(5);
        let root = merkle_root(&l);
        l.swap(1, 3);
        assert_ne!(root, merkle_root(&l));
    }

    #[test]
    fn inclusion_proofs_verify_for_every_leaf() {
        for size in [1usize, 2, 5, 8, 13] {
            let l = leaves(size);
            let root = merkle_root(&l);
            for (i, leaf) in l.iter().enumerate() {
                let proof = inclusion_proof(&l, i).unwrap();
                assert!(verify_inclusion(leaf, i, size, &proof, &root), "size {size} index {i}");
                assert!(!verify_inclusion(&Hash::ZERO, i, size, &proof, &root));
            }
            assert!(inclusion_proof(&l, size).is_none());
        }
    }
}
