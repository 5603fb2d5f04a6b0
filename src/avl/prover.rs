use std::collections::{HashMap, HashSet};

use crate::avl::node::{Label, Node};
use crate::errors::{ChainError, ChainResult};
use crate::types::{AdDigest, BoxId, write_varint};

/// Backing storage for nodes that fell out of the in-memory cache.
pub trait NodeSource: Send + Sync {
    fn fetch(&self, label: &Label) -> ChainResult<Option<Node>>;
}

/// Source with no backing store; every node must live in the cache.
pub struct NullSource;

impl NodeSource for NullSource {
    fn fetch(&self, _label: &Label) -> ChainResult<Option<Node>> {
        Ok(None)
    }
}

/// One element of a batch modification.
#[derive(Clone, Debug)]
pub enum AvlOp {
    Insert { key: BoxId, value: Vec<u8> },
    Remove { key: BoxId },
}

impl AvlOp {
    pub fn key(&self) -> &BoxId {
        match self {
            AvlOp::Insert { key, .. } | AvlOp::Remove { key } => key,
        }
    }
}

/// Persistent AVL dictionary with content-addressed nodes.
///
/// Mutations create fresh nodes; the previous root stays intact, which makes
/// rollback a pointer move and lets several versions share structure.
pub struct AvlTree {
    cache: HashMap<Label, Node>,
    dirty: HashSet<Label>,
    root: Option<(Label, u8)>,
    source: Box<dyn NodeSource>,
}

impl AvlTree {
    pub fn new(source: Box<dyn NodeSource>) -> Self {
        AvlTree {
            cache: HashMap::new(),
            dirty: HashSet::new(),
            root: None,
            source,
        }
    }

    /// Reopens a tree at a previously committed digest.
    pub fn open_at(source: Box<dyn NodeSource>, digest: &AdDigest) -> ChainResult<Self> {
        let mut tree = Self::new(source);
        tree.rollback(digest)?;
        Ok(tree)
    }

    pub fn digest(&self) -> AdDigest {
        match self.root {
            None => AdDigest::empty(),
            Some((root, tree_height)) => AdDigest { root, tree_height },
        }
    }

    fn try_node(&mut self, label: &Label) -> ChainResult<Option<Node>> {
        if let Some(node) = self.cache.get(label) {
            return Ok(Some(node.clone()));
        }
        match self.source.fetch(label)? {
            Some(node) => {
                self.cache.insert(*label, node.clone());
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    fn node(&mut self, label: &Label) -> ChainResult<Node> {
        self.try_node(label)?.ok_or_else(|| {
            ChainError::Fatal(format!("avl node {} missing from store", hex::encode(label)))
        })
    }

    fn put(&mut self, node: Node) -> Label {
        let label = node.label();
        self.dirty.insert(label);
        self.cache.insert(label, node);
        label
    }

    fn height_of(&mut self, label: &Label) -> ChainResult<u8> {
        Ok(self.node(label)?.height())
    }

    /// Plain lookup against the current root; no proof is produced.
    pub fn lookup(&mut self, key: &BoxId) -> ChainResult<Option<Vec<u8>>> {
        let Some((mut label, _)) = self.root else {
            return Ok(None);
        };
        loop {
            match self.node(&label)? {
                Node::Leaf { key: leaf_key, value } => {
                    return Ok((leaf_key == *key).then_some(value));
                }
                Node::Internal {
                    split, left, right, ..
                } => {
                    label = if *key <= split { left } else { right };
                }
            }
        }
    }

    pub fn contains(&mut self, key: &BoxId) -> ChainResult<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Root-to-leaf trace for `key`: direction taken and the label of the
    /// sibling not taken. Witness material for proofs.
    fn path_to(&mut self, key: &BoxId) -> ChainResult<Vec<(u8, Label)>> {
        let mut path = Vec::new();
        let Some((mut label, _)) = self.root else {
            return Ok(path);
        };
        loop {
            match self.node(&label)? {
                Node::Leaf { .. } => return Ok(path),
                Node::Internal {
                    split, left, right, ..
                } => {
                    if *key <= split {
                        path.push((0u8, right));
                        label = left;
                    } else {
                        path.push((1u8, left));
                        label = right;
                    }
                }
            }
        }
    }

    fn insert(&mut self, key: &BoxId, value: &[u8]) -> ChainResult<()> {
        match self.root {
            None => {
                let label = self.put(Node::Leaf {
                    key: *key,
                    value: value.to_vec(),
                });
                self.root = Some((label, 0));
            }
            Some((root, _)) => {
                let new_root = self.insert_rec(root, key, value)?;
                let height = self.height_of(&new_root)?;
                self.root = Some((new_root, height));
            }
        }
        Ok(())
    }

    fn insert_rec(&mut self, label: Label, key: &BoxId, value: &[u8]) -> ChainResult<Label> {
        match self.node(&label)? {
            Node::Leaf { key: leaf_key, .. } => {
                if leaf_key == *key {
                    return Err(ChainError::StateInvalid(
                        "box id already present in state".into(),
                    ));
                }
                let new_leaf = self.put(Node::Leaf {
                    key: *key,
                    value: value.to_vec(),
                });
                let (split, left, right) = if *key < leaf_key {
                    (*key, new_leaf, label)
                } else {
                    (leaf_key, label, new_leaf)
                };
                Ok(self.put(Node::Internal {
                    split,
                    height: 1,
                    left,
                    right,
                }))
            }
            Node::Internal {
                split, left, right, ..
            } => {
                if *key <= split {
                    let new_left = self.insert_rec(left, key, value)?;
                    self.build(split, new_left, right)
                } else {
                    let new_right = self.insert_rec(right, key, value)?;
                    self.build(split, left, new_right)
                }
            }
        }
    }

    fn remove(&mut self, key: &BoxId) -> ChainResult<()> {
        let Some((root, _)) = self.root else {
            return Err(ChainError::StateInvalid("box id not present in state".into()));
        };
        match self.remove_rec(root, key)? {
            None => self.root = None,
            Some(new_root) => {
                let height = self.height_of(&new_root)?;
                self.root = Some((new_root, height));
            }
        }
        Ok(())
    }

    fn remove_rec(&mut self, label: Label, key: &BoxId) -> ChainResult<Option<Label>> {
        match self.node(&label)? {
            Node::Leaf { key: leaf_key, .. } => {
                if leaf_key == *key {
                    Ok(None)
                } else {
                    Err(ChainError::StateInvalid("box id not present in state".into()))
                }
            }
            Node::Internal {
                split, left, right, ..
            } => {
                if *key <= split {
                    match self.remove_rec(left, key)? {
                        None => Ok(Some(right)),
                        Some(new_left) => Ok(Some(self.build(split, new_left, right)?)),
                    }
                } else {
                    match self.remove_rec(right, key)? {
                        None => Ok(Some(left)),
                        Some(new_right) => Ok(Some(self.build(split, left, new_right)?)),
                    }
                }
            }
        }
    }

    /// Internal node without rebalancing; children are already within one
    /// level of each other.
    fn make(&mut self, split: BoxId, left: Label, right: Label) -> ChainResult<Label> {
        let height = 1 + self.height_of(&left)?.max(self.height_of(&right)?);
        Ok(self.put(Node::Internal {
            split,
            height,
            left,
            right,
        }))
    }

    fn internal_parts(&mut self, label: &Label) -> ChainResult<(BoxId, Label, Label)> {
        match self.node(label)? {
            Node::Internal {
                split, left, right, ..
            } => Ok((split, left, right)),
            Node::Leaf { .. } => Err(ChainError::Fatal(
                "avl rotation descended into a leaf".into(),
            )),
        }
    }

    /// Internal node with AVL rebalancing. Rotations reuse the split keys of
    /// the rotated nodes; subtree membership is unchanged by a rotation.
    fn build(&mut self, split: BoxId, left: Label, right: Label) -> ChainResult<Label> {
        let hl = i16::from(self.height_of(&left)?);
        let hr = i16::from(self.height_of(&right)?);
        match hl - hr {
            -1..=1 => self.make(split, left, right),
            2 => {
                let (ls, ll, lr) = self.internal_parts(&left)?;
                if self.height_of(&ll)? >= self.height_of(&lr)? {
                    let inner = self.make(split, lr, right)?;
                    self.make(ls, ll, inner)
                } else {
                    let (lrs, lrl, lrr) = self.internal_parts(&lr)?;
                    let new_left = self.make(ls, ll, lrl)?;
                    let new_right = self.make(split, lrr, right)?;
                    self.make(lrs, new_left, new_right)
                }
            }
            -2 => {
                let (rs, rl, rr) = self.internal_parts(&right)?;
                if self.height_of(&rr)? >= self.height_of(&rl)? {
                    let inner = self.make(split, left, rl)?;
                    self.make(rs, inner, rr)
                } else {
                    let (rls, rll, rlr) = self.internal_parts(&rl)?;
                    let new_left = self.make(split, left, rll)?;
                    let new_right = self.make(rs, rlr, rr)?;
                    self.make(rls, new_left, new_right)
                }
            }
            _ => Err(ChainError::Fatal("avl balance invariant broken".into())),
        }
    }

    /// Applies a batch of operations and returns the witness bytes binding
    /// the pre-digest to the post-digest. On any failure the tree is left at
    /// the pre-batch digest.
    pub fn perform_batch(&mut self, ops: &[AvlOp]) -> ChainResult<Vec<u8>> {
        let pre_root = self.root;
        let pre_dirty = self.dirty.clone();

        let mut proof = Vec::new();
        proof.extend_from_slice(&self.digest().to_bytes());
        write_varint(&mut proof, ops.len() as u64);

        for op in ops {
            let path = match self.path_to(op.key()) {
                Ok(path) => path,
                Err(err) => {
                    self.root = pre_root;
                    self.dirty = pre_dirty;
                    return Err(err);
                }
            };
            match op {
                AvlOp::Insert { key, value } => {
                    proof.push(1);
                    key.write_to(&mut proof);
                    write_varint(&mut proof, value.len() as u64);
                    proof.extend_from_slice(value);
                }
                AvlOp::Remove { key } => {
                    proof.push(2);
                    key.write_to(&mut proof);
                }
            }
            write_varint(&mut proof, path.len() as u64);
            for (direction, sibling) in &path {
                proof.push(*direction);
                proof.extend_from_slice(sibling);
            }

            let applied = match op {
                AvlOp::Insert { key, value } => self.insert(key, value),
                AvlOp::Remove { key } => self.remove(key),
            };
            if let Err(err) = applied {
                self.root = pre_root;
                self.dirty = pre_dirty;
                return Err(err);
            }
        }

        proof.extend_from_slice(&self.digest().to_bytes());
        Ok(proof)
    }

    /// Applies `ops`, captures the proof and resulting digest, then restores
    /// the pre-batch root on every exit path, panics included.
    pub fn run_speculative(&mut self, ops: &[AvlOp]) -> ChainResult<(Vec<u8>, AdDigest)> {
        struct Restore<'a> {
            tree: &'a mut AvlTree,
            root: Option<(Label, u8)>,
            dirty: HashSet<Label>,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.tree.root = self.root;
                self.tree.dirty = std::mem::take(&mut self.dirty);
            }
        }
        let guard = Restore {
            root: self.root,
            dirty: self.dirty.clone(),
            tree: self,
        };
        let proof = guard.tree.perform_batch(ops)?;
        let digest = guard.tree.digest();
        Ok((proof, digest))
    }

    /// Moves the root to a digest whose nodes are still reachable. Discards
    /// uncommitted nodes created after that digest.
    pub fn rollback(&mut self, digest: &AdDigest) -> ChainResult<()> {
        if *digest == AdDigest::empty() {
            self.root = None;
            self.dirty.clear();
            return Ok(());
        }
        let node = self.try_node(&digest.root)?.ok_or_else(|| {
            ChainError::NotApplicable(format!("no dictionary nodes for digest {digest}"))
        })?;
        if node.height() != digest.tree_height {
            return Err(ChainError::Fatal(format!(
                "digest height {} disagrees with stored node height {}",
                digest.tree_height,
                node.height()
            )));
        }
        self.root = Some((digest.root, digest.tree_height));
        self.dirty.clear();
        Ok(())
    }

    /// Serialized nodes created since the last commit, for persistence.
    pub fn dirty_nodes(&self) -> ChainResult<Vec<(Label, Vec<u8>)>> {
        let mut out = Vec::with_capacity(self.dirty.len());
        for label in &self.dirty {
            let node = self
                .cache
                .get(label)
                .ok_or_else(|| ChainError::Fatal("dirty avl node missing from cache".into()))?;
            out.push((*label, bincode::serialize(node)?));
        }
        Ok(out)
    }

    pub fn mark_committed(&mut self) {
        self.dirty.clear();
    }
}
