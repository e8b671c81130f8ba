//! Deduplicating node store: hash -> node bytes with reference counts, plus
//! the bounded root history used for garbage collection.
//!
//! One reader/writer lock covers both maps so install and delete stay atomic
//! against traversals.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use crate::tree::{self, Hash, NodeTag};

/// How many past roots each peer (and the local node) keeps alive.
pub const ROOT_HISTORY_LEN: usize = 3;

#[derive(Default)]
struct StoreInner {
    nodes: HashMap<Hash, Vec<u8>>,
    refs: HashMap<Hash, u32>,
}

/// In-memory Merkle node store shared by the builder, the fetch pipeline and
/// the datum request handler.
#[derive(Default)]
pub struct MerkleStore {
    inner: RwLock<StoreInner>,
}

impl MerkleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a node: insert it if unknown, otherwise bump its refcount.
    /// Returns the node's hash.
    pub fn fill(&self, node: Vec<u8>) -> Hash {
        let hash = tree::sha(&node);
        let mut inner = self.inner.write().expect("store lock");
        if inner.nodes.contains_key(&hash) {
            *inner.refs.entry(hash).or_insert(0) += 1;
        } else {
            inner.nodes.insert(hash, node);
            inner.refs.insert(hash, 1);
        }
        hash
    }

    /// Look up a node by hash.
    pub fn find(&self, hash: &Hash) -> Option<Vec<u8>> {
        self.inner
            .read()
            .expect("store lock")
            .nodes
            .get(hash)
            .cloned()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner
            .read()
            .expect("store lock")
            .nodes
            .contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("store lock").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reference count of a stored node, 0 when absent.
    pub fn refcount(&self, hash: &Hash) -> u32 {
        self.inner
            .read()
            .expect("store lock")
            .refs
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    /// Drop one reference to the tree rooted at `root`, removing nodes whose
    /// count reaches zero. A visited set keeps shared subtrees from being
    /// decremented twice by the same deletion.
    pub fn delete_tree(&self, root: &Hash) {
        let mut inner = self.inner.write().expect("store lock");
        let mut visited = HashSet::new();
        delete_node(&mut inner, root, &mut visited);
    }

    /// Walk the tree under `root`: true iff every reachable hash is stored
    /// and every tag is known.
    pub fn verify(&self, root: &Hash) -> bool {
        let inner = self.inner.read().expect("store lock");
        let mut visited = HashSet::new();
        verify_node(&inner, root, &mut visited)
    }

    /// Linear scan over Directory nodes for an entry with this name.
    pub fn find_name(&self, name: &str) -> Option<Hash> {
        let inner = self.inner.read().expect("store lock");
        for node in inner.nodes.values() {
            if tree::node_tag(node) != Some(NodeTag::Directory) {
                continue;
            }
            for (entry_name, hash) in tree::directory_entries(node) {
                if entry_name == name {
                    return Some(hash);
                }
            }
        }
        None
    }
}

fn delete_node(inner: &mut StoreInner, hash: &Hash, visited: &mut HashSet<Hash>) {
    if !visited.insert(*hash) {
        return;
    }
    let node = match inner.nodes.get(hash) {
        Some(n) => n.clone(),
        None => return,
    };
    let count = inner.refs.entry(*hash).or_insert(1);
    *count = count.saturating_sub(1);
    if *count > 0 {
        return;
    }
    for child in tree::children(&node) {
        delete_node(inner, &child, visited);
    }
    inner.nodes.remove(hash);
    inner.refs.remove(hash);
}

fn verify_node(inner: &StoreInner, hash: &Hash, visited: &mut HashSet<Hash>) -> bool {
    if !visited.insert(*hash) {
        return true;
    }
    let node = match inner.nodes.get(hash) {
        Some(n) => n,
        None => return false,
    };
    match tree::node_tag(node) {
        Some(NodeTag::Chunk) => true,
        Some(_) => {
            let children = tree::children(node);
            children.iter().all(|c| verify_node(inner, c, visited))
        }
        None => false,
    }
}

/// Strict most-recent-last queue of the roots a node has advertised,
/// bounded at [`ROOT_HISTORY_LEN`].
#[derive(Debug, Default, Clone)]
pub struct RootHistory {
    roots: VecDeque<Hash>,
}

impl RootHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a root; returns the evicted oldest root when the queue was full.
    pub fn push(&mut self, root: Hash) -> Option<Hash> {
        self.roots.push_back(root);
        if self.roots.len() > ROOT_HISTORY_LEN {
            self.roots.pop_front()
        } else {
            None
        }
    }

    pub fn contains(&self, root: &Hash) -> bool {
        self.roots.contains(root)
    }

    /// Indexed access, oldest first.
    pub fn get(&self, index: usize) -> Option<&Hash> {
        self.roots.get(index)
    }

    pub fn latest(&self) -> Option<&Hash> {
        self.roots.back()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hash> {
        self.roots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{chunk_node, directory_node, fanout_node, sha};

    #[test]
    fn fill_deduplicates_and_counts() {
        let store = MerkleStore::new();
        let node = chunk_node(b"data");
        let h1 = store.fill(node.clone());
        let h2 = store.fill(node);
        assert_eq!(h1, h2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.refcount(&h1), 2);
    }

    #[test]
    fn stored_hash_matches_content() {
        let store = MerkleStore::new();
        let node = chunk_node(b"payload");
        let expected = sha(&node);
        let hash = store.fill(node.clone());
        assert_eq!(hash, expected);
        assert_eq!(store.find(&hash).unwrap(), node);
    }

    #[test]
    fn verify_detects_missing_child() {
        let store = MerkleStore::new();
        let chunk = chunk_node(b"leaf");
        let leaf = sha(&chunk);
        let root_node = fanout_node(NodeTag::Big, &[leaf]);
        let root = store.fill(root_node);
        assert!(!store.verify(&root));
        store.fill(chunk);
        assert!(store.verify(&root));
    }

    #[test]
    fn delete_tree_respects_shared_subtrees() {
        let store = MerkleStore::new();
        // Two roots sharing one chunk.
        let chunk = chunk_node(b"shared");
        let leaf_a = store.fill(chunk.clone());
        let root1 = store.fill(fanout_node(NodeTag::Big, &[leaf_a]));
        let leaf_b = store.fill(chunk);
        assert_eq!(leaf_a, leaf_b);
        let other = store.fill(chunk_node(b"only-in-2"));
        let root2 = store.fill(fanout_node(NodeTag::Big, &[leaf_a, other]));

        store.delete_tree(&root1);
        assert!(!store.contains(&root1));
        // Shared chunk still referenced through root2.
        assert!(store.contains(&leaf_a));
        assert!(store.verify(&root2));

        store.delete_tree(&root2);
        assert!(store.is_empty());
    }

    #[test]
    fn delete_missing_root_is_noop() {
        let store = MerkleStore::new();
        store.delete_tree(&[9u8; 32]);
        assert!(store.is_empty());
    }

    #[test]
    fn find_name_scans_directories() {
        let store = MerkleStore::new();
        let child = store.fill(chunk_node(b"file body"));
        store.fill(directory_node(&[("notes.txt".into(), child)]));
        assert_eq!(store.find_name("notes.txt"), Some(child));
        assert_eq!(store.find_name("absent"), None);
    }

    #[test]
    fn root_history_evicts_oldest() {
        let mut history = RootHistory::new();
        assert_eq!(history.push([1u8; 32]), None);
        assert_eq!(history.push([2u8; 32]), None);
        assert_eq!(history.push([3u8; 32]), None);
        assert_eq!(history.push([4u8; 32]), Some([1u8; 32]));
        assert_eq!(history.len(), 3);
        assert_eq!(history.get(0), Some(&[2u8; 32]));
        assert_eq!(history.latest(), Some(&[4u8; 32]));
        assert!(!history.contains(&[1u8; 32]));
    }
}
