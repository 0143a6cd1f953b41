//! Merkle roots over SHA-256 leaves
//!
//! Leaves are `SHA256(chunk)`. Interior nodes hash the concatenation of
//! their children; an odd node at the end of a level is paired with itself.

use super::sha256;

pub type Hash = [u8; 32];

/// Hash of an internal node
fn node(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256(&buf)
}

/// Root of a list of leaf hashes; the empty tree hashes the empty string
pub fn root_of_leaves(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return sha256(&[]);
    }
    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [l, r] => node(l, r),
                [single] => node(single, single),
                _ => unreachable!(),
            })
            .collect();
    }
    level[0]
}

/// Root over `data` split into fixed-size chunks
pub fn root_of_chunks(data: &[u8], chunk_size: usize) -> Hash {
    let chunk_size = chunk_size.max(1);
    let leaves: Vec<Hash> = data.chunks(chunk_size).map(sha256).collect();
    root_of_leaves(&leaves)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_leaf_is_root() {
        let leaf = sha256(b"a");
        assert_eq!(root_of_leaves(&[leaf]), leaf);
    }

    #[test]
    fn test_odd_leaf_duplicated() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        let c = sha256(b"c");
        let expected = node(&node(&a, &b), &node(&c, &c));
        assert_eq!(root_of_leaves(&[a, b, c]), expected);
    }

    #[test]
    fn test_root_changes_with_content() {
        let data = vec![1u8; 1000];
        let mut tampered = data.clone();
        tampered[500] = 2;
        assert_ne!(root_of_chunks(&data, 64), root_of_chunks(&tampered, 64));
        assert_eq!(root_of_chunks(&data, 64), root_of_chunks(&data.clone(), 64));
    }
}
