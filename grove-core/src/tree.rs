//! Content-addressed tree: node layouts, builder over a filesystem path,
//! restore back to the filesystem.
//!
//! Every node is `tag[1] || payload` and is addressed by the SHA-256 of the
//! whole sequence. Files chunk at 1024 bytes and fan out through Big nodes of
//! up to 32 children; directories pack 16 entries per Directory node and fan
//! out through BigDirectory nodes.

use std::fs;
use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::store::MerkleStore;

pub const CHUNK_SIZE: usize = 1024;
pub const HASH_LEN: usize = 32;
pub const NAME_LEN: usize = 32;
pub const DIR_ENTRY_LEN: usize = NAME_LEN + HASH_LEN;
pub const MAX_DIR_ENTRIES: usize = 16;
pub const MAX_BIG_ENTRIES: usize = 32;
pub const TAG_LEN: usize = 1;

pub type Hash = [u8; HASH_LEN];

/// SHA-256 of a byte sequence.
pub fn sha(bytes: &[u8]) -> Hash {
    Sha256::digest(bytes).into()
}

/// The four node kinds, stored as the first byte of every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeTag {
    Chunk = 0,
    Directory = 1,
    Big = 2,
    BigDirectory = 3,
}

impl NodeTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Chunk,
            1 => Self::Directory,
            2 => Self::Big,
            3 => Self::BigDirectory,
            _ => return None,
        })
    }
}

/// Tag of a node, if the node is non-empty and the tag is known.
pub fn node_tag(node: &[u8]) -> Option<NodeTag> {
    node.first().and_then(|b| NodeTag::from_byte(*b))
}

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("node {0} not in store")]
    MissingNode(String),
    #[error("unknown node tag {0}")]
    UnknownTag(u8),
    #[error("node tag {0} not admissible here")]
    InvalidChild(u8),
}

/// Build a Chunk node around up to [`CHUNK_SIZE`] bytes of file data.
pub fn chunk_node(data: &[u8]) -> Vec<u8> {
    let mut node = Vec::with_capacity(TAG_LEN + data.len());
    node.push(NodeTag::Chunk as u8);
    node.extend_from_slice(data);
    node
}

fn pad_name(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Build a Directory node from up to [`MAX_DIR_ENTRIES`] named children.
pub fn directory_node(entries: &[(String, Hash)]) -> Vec<u8> {
    let mut node = Vec::with_capacity(TAG_LEN + entries.len() * DIR_ENTRY_LEN);
    node.push(NodeTag::Directory as u8);
    for (name, hash) in entries {
        node.extend_from_slice(&pad_name(name));
        node.extend_from_slice(hash);
    }
    node
}

/// Build a Big or BigDirectory node from up to [`MAX_BIG_ENTRIES`] child hashes.
pub fn fanout_node(tag: NodeTag, children: &[Hash]) -> Vec<u8> {
    let mut node = Vec::with_capacity(TAG_LEN + children.len() * HASH_LEN);
    node.push(tag as u8);
    for hash in children {
        node.extend_from_slice(hash);
    }
    node
}

/// Child hashes a node references, in layout order. Chunks have none.
pub fn children(node: &[u8]) -> Vec<Hash> {
    let mut out = Vec::new();
    match node_tag(node) {
        Some(NodeTag::Directory) => {
            let mut offset = TAG_LEN;
            while offset + DIR_ENTRY_LEN <= node.len() {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(&node[offset + NAME_LEN..offset + DIR_ENTRY_LEN]);
                out.push(hash);
                offset += DIR_ENTRY_LEN;
            }
        }
        Some(NodeTag::Big) | Some(NodeTag::BigDirectory) => {
            let mut offset = TAG_LEN;
            while offset + HASH_LEN <= node.len() {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(&node[offset..offset + HASH_LEN]);
                out.push(hash);
                offset += HASH_LEN;
            }
        }
        _ => {}
    }
    out
}

/// Named entries of a Directory node, with padding zeros trimmed.
pub fn directory_entries(node: &[u8]) -> Vec<(String, Hash)> {
    let mut out = Vec::new();
    if node_tag(node) != Some(NodeTag::Directory) {
        return out;
    }
    let mut offset = TAG_LEN;
    while offset + DIR_ENTRY_LEN <= node.len() {
        let raw = &node[offset..offset + NAME_LEN];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        let name = String::from_utf8_lossy(&raw[..end]).into_owned();
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&node[offset + NAME_LEN..offset + DIR_ENTRY_LEN]);
        out.push((name, hash));
        offset += DIR_ENTRY_LEN;
    }
    out
}

/// Build the Merkle tree of a file or directory and install every node in
/// the store. Returns the root hash. Directory entries are hashed in
/// name-sorted order so roots are stable across platforms.
pub fn build_path(store: &MerkleStore, path: &Path) -> Result<Hash, TreeError> {
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        build_directory(store, path)
    } else {
        build_file(store, path)
    }
}

fn build_file(store: &MerkleStore, path: &Path) -> Result<Hash, TreeError> {
    let data = fs::read(path)?;
    let mut level: Vec<Hash> = data
        .chunks(CHUNK_SIZE)
        .map(|c| store.fill(chunk_node(c)))
        .collect();
    if level.is_empty() {
        // Empty file: a single bare Chunk node.
        level.push(store.fill(chunk_node(&[])));
    }
    while level.len() > 1 {
        level = merge_level(store, &level, NodeTag::Big);
    }
    Ok(level[0])
}

fn build_directory(store: &MerkleStore, path: &Path) -> Result<Hash, TreeError> {
    let mut names: Vec<String> = fs::read_dir(path)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        let child = build_path(store, &path.join(&name))?;
        entries.push((name, child));
    }

    if entries.len() <= MAX_DIR_ENTRIES {
        return Ok(store.fill(directory_node(&entries)));
    }
    let mut level: Vec<Hash> = entries
        .chunks(MAX_DIR_ENTRIES)
        .map(|group| store.fill(directory_node(group)))
        .collect();
    while level.len() > 1 {
        level = merge_level(store, &level, NodeTag::BigDirectory);
    }
    Ok(level[0])
}

fn merge_level(store: &MerkleStore, level: &[Hash], tag: NodeTag) -> Vec<Hash> {
    level
        .chunks(MAX_BIG_ENTRIES)
        .map(|group| store.fill(fanout_node(tag, group)))
        .collect()
}

/// Rebuild a subtree from the store at `dest`, removing anything already
/// there first.
pub fn restore(store: &MerkleStore, root: &Hash, dest: &Path) -> Result<(), TreeError> {
    if dest.exists() {
        if fs::metadata(dest)?.is_dir() {
            fs::remove_dir_all(dest)?;
        } else {
            fs::remove_file(dest)?;
        }
    }
    restore_node(store, root, dest)
}

fn restore_node(store: &MerkleStore, hash: &Hash, dest: &Path) -> Result<(), TreeError> {
    let node = store
        .find(hash)
        .ok_or_else(|| TreeError::MissingNode(hex::encode(hash)))?;
    match node_tag(&node) {
        Some(NodeTag::Chunk) => {
            fs::write(dest, &node[TAG_LEN..])?;
            Ok(())
        }
        Some(NodeTag::Directory) => {
            fs::create_dir_all(dest)?;
            for (name, child) in directory_entries(&node) {
                let name = unique_name(dest, &name);
                restore_node(store, &child, &dest.join(name))?;
            }
            Ok(())
        }
        Some(NodeTag::Big) => {
            let mut file = fs::File::create(dest)?;
            write_big(store, &mut file, &node)?;
            Ok(())
        }
        Some(NodeTag::BigDirectory) => {
            // Children merge into the same directory path.
            for child in children(&node) {
                restore_node(store, &child, dest)?;
            }
            Ok(())
        }
        None => Err(TreeError::UnknownTag(node.first().copied().unwrap_or(255))),
    }
}

fn write_big(store: &MerkleStore, file: &mut fs::File, node: &[u8]) -> Result<(), TreeError> {
    for hash in children(node) {
        let child = store
            .find(&hash)
            .ok_or_else(|| TreeError::MissingNode(hex::encode(hash)))?;
        match node_tag(&child) {
            Some(NodeTag::Chunk) => file.write_all(&child[TAG_LEN..])?,
            Some(NodeTag::Big) => write_big(store, file, &child)?,
            other => {
                return Err(TreeError::InvalidChild(
                    other.map(|t| t as u8).unwrap_or(255),
                ))
            }
        }
    }
    Ok(())
}

/// Indented listing of a stored tree, for display and debugging. Missing
/// nodes are marked rather than failing the walk.
pub fn render(store: &MerkleStore, root: &Hash) -> String {
    let mut out = String::new();
    render_node(store, root, 0, &mut out);
    out
}

fn render_node(store: &MerkleStore, hash: &Hash, depth: usize, out: &mut String) {
    use std::fmt::Write;
    let prefix = "  ".repeat(depth);
    let Some(node) = store.find(hash) else {
        let _ = writeln!(out, "{prefix}<missing {}>", hex::encode(hash));
        return;
    };
    match node_tag(&node) {
        Some(NodeTag::Chunk) => {
            let _ = writeln!(out, "{prefix}chunk ({} bytes)", node.len() - TAG_LEN);
        }
        Some(NodeTag::Directory) => {
            let _ = writeln!(out, "{prefix}directory/");
            for (name, child) in directory_entries(&node) {
                let _ = writeln!(out, "{prefix}  {name}");
                render_node(store, &child, depth + 2, out);
            }
        }
        Some(NodeTag::Big) | Some(NodeTag::BigDirectory) => {
            let _ = writeln!(out, "{prefix}fanout x{}", children(&node).len());
            for child in children(&node) {
                render_node(store, &child, depth + 1, out);
            }
        }
        None => {
            let _ = writeln!(out, "{prefix}<unknown tag {}>", node.first().copied().unwrap_or(255));
        }
    }
}

/// Pick a name that does not collide inside `dir`, suffixing `(N)` before
/// the extension when needed.
fn unique_name(dir: &Path, name: &str) -> String {
    if !dir.join(name).exists() {
        return name.to_owned();
    }
    let (base, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let mut counter = 1;
    loop {
        let candidate = format!("{base}({counter}){ext}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        counter += 1;
    }
}
